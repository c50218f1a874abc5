//! Scheduling decisions and the entities a checkpoint is made of.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The artifacts that together form one complete checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Model,
    Optimizer,
}

impl EntityKind {
    /// Every entity, in write order.
    pub const ALL: [EntityKind; 2] = [EntityKind::Model, EntityKind::Optimizer];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Model => "model",
            EntityKind::Optimizer => "optimizer",
        }
    }

    /// Tag byte used in artifact headers.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            EntityKind::Model => 1,
            EntityKind::Optimizer => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntityKind::Model),
            2 => Some(EntityKind::Optimizer),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(EntityKind::Model),
            "optimizer" => Ok(EntityKind::Optimizer),
            other => Err(format!("unknown checkpoint entity '{}'", other)),
        }
    }
}

/// One scheduling decision: whether to persist the current state and which
/// previously saved checkpoints (by progress marker, oldest first) to delete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInstruction {
    pub save_current: bool,
    pub checkpoints_to_delete: Vec<u64>,
}

impl CheckpointInstruction {
    /// Neither save nor delete.
    pub fn skip() -> Self {
        Self::default()
    }

    /// Save, delete nothing.
    pub fn save() -> Self {
        Self {
            save_current: true,
            checkpoints_to_delete: Vec::new(),
        }
    }

    /// Set markers to delete.
    pub fn with_deletions(mut self, markers: Vec<u64>) -> Self {
        self.checkpoints_to_delete = markers;
        self
    }

    pub fn is_noop(&self) -> bool {
        !self.save_current && self.checkpoints_to_delete.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_names_and_tags() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
            assert_eq!(EntityKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(EntityKind::Optimizer.to_string(), "optimizer");
        assert!("scheduler".parse::<EntityKind>().is_err());
        assert!(EntityKind::from_tag(0).is_none());
    }

    #[test]
    fn test_instruction_builders() {
        assert!(CheckpointInstruction::skip().is_noop());

        let instruction = CheckpointInstruction::save().with_deletions(vec![10, 20]);
        assert!(instruction.save_current);
        assert_eq!(instruction.checkpoints_to_delete, vec![10, 20]);
        assert!(!instruction.is_noop());
    }

    #[test]
    fn test_instruction_json_shape() {
        let instruction = CheckpointInstruction::save().with_deletions(vec![10]);
        let json = serde_json::to_value(&instruction).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "save_current": true, "checkpoints_to_delete": [10] })
        );
        assert_eq!(serde_json::to_string(&EntityKind::Model).unwrap(), "\"model\"");
    }
}
