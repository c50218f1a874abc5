//! Checkpointing policies.
//!
//! A strategy turns a progress marker into a `CheckpointInstruction`. The
//! policy kind is chosen once from configuration; each kind is a plain struct
//! and `CheckpointingStrategy` dispatches to it.
//!
//! Every rank holds its own strategy and feeds it the same markers, so all
//! ranks derive identical instructions without communicating.

use super::instruction::CheckpointInstruction;
use crate::{CheckpointError, Result};
use serde::{Deserialize, Serialize};

/// Strategy selection as written in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Save whenever the marker is divisible by `k`. Never deletes.
    SaveEveryKSteps { k: i64 },
    /// Keep the `k` most recent checkpoints. `-1` keeps all, `0` never saves.
    SaveKMostRecent {
        k: i64,
        #[serde(default = "default_interval")]
        interval: u64,
    },
}

fn default_interval() -> u64 {
    1
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::SaveKMostRecent { k: 3, interval: 1 }
    }
}

/// Rejects markers that do not strictly increase.
#[derive(Clone, Debug, Default)]
struct ProgressGuard {
    last: Option<u64>,
}

impl ProgressGuard {
    fn advance(&mut self, marker: u64) -> Result<()> {
        if let Some(previous) = self.last {
            if marker <= previous {
                return Err(CheckpointError::NonMonotonicProgress {
                    previous,
                    current: marker,
                });
            }
        }
        self.last = Some(marker);
        Ok(())
    }
}

/// Save every `k`-th marker.
#[derive(Clone, Debug)]
pub struct SaveEveryKSteps {
    k: u64,
    progress: ProgressGuard,
}

impl SaveEveryKSteps {
    pub fn new(k: i64) -> Result<Self> {
        if k <= 0 {
            return Err(CheckpointError::Configuration(format!(
                "save_every_k_steps requires k > 0, got {}",
                k
            )));
        }
        Ok(Self {
            k: k as u64,
            progress: ProgressGuard::default(),
        })
    }

    pub fn k(&self) -> u64 {
        self.k
    }

    fn decide(&mut self, marker: u64) -> Result<CheckpointInstruction> {
        self.progress.advance(marker)?;
        if marker % self.k == 0 {
            Ok(CheckpointInstruction::save())
        } else {
            Ok(CheckpointInstruction::skip())
        }
    }
}

/// How many checkpoints `SaveKMostRecent` keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    Never,
    Bounded(usize),
    Unbounded,
}

/// Keep a FIFO window of the most recent saved markers.
#[derive(Clone, Debug)]
pub struct SaveKMostRecent {
    retention: Retention,
    interval: u64,
    window: Vec<u64>,
    progress: ProgressGuard,
}

impl SaveKMostRecent {
    pub fn new(k: i64, interval: u64) -> Result<Self> {
        let retention = match k {
            -1 => Retention::Unbounded,
            0 => Retention::Never,
            k if k > 0 => Retention::Bounded(k as usize),
            k => {
                return Err(CheckpointError::Configuration(format!(
                    "save_k_most_recent requires k >= -1, got {}",
                    k
                )))
            }
        };
        if interval == 0 {
            return Err(CheckpointError::Configuration(
                "save_k_most_recent requires interval > 0".into(),
            ));
        }
        Ok(Self {
            retention,
            interval,
            window: Vec::new(),
            progress: ProgressGuard::default(),
        })
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    fn decide(&mut self, marker: u64) -> Result<CheckpointInstruction> {
        self.progress.advance(marker)?;

        if self.retention == Retention::Never || marker % self.interval != 0 {
            return Ok(CheckpointInstruction::skip());
        }

        self.window.push(marker);
        let mut to_delete = Vec::new();
        if let Retention::Bounded(k) = self.retention {
            while self.window.len() > k {
                to_delete.push(self.window.remove(0));
            }
        }

        Ok(CheckpointInstruction::save().with_deletions(to_delete))
    }
}

/// Checkpointing policy, resolved once from configuration.
#[derive(Clone, Debug)]
pub enum CheckpointingStrategy {
    SaveEveryKSteps(SaveEveryKSteps),
    SaveKMostRecent(SaveKMostRecent),
}

impl CheckpointingStrategy {
    /// Build the configured policy.
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        match *config {
            StrategyConfig::SaveEveryKSteps { k } => {
                Ok(CheckpointingStrategy::SaveEveryKSteps(SaveEveryKSteps::new(k)?))
            }
            StrategyConfig::SaveKMostRecent { k, interval } => Ok(
                CheckpointingStrategy::SaveKMostRecent(SaveKMostRecent::new(k, interval)?),
            ),
        }
    }

    /// Decide what to do at `marker`. Markers must strictly increase across calls.
    pub fn decide(&mut self, marker: u64) -> Result<CheckpointInstruction> {
        let instruction = match self {
            CheckpointingStrategy::SaveEveryKSteps(s) => s.decide(marker)?,
            CheckpointingStrategy::SaveKMostRecent(s) => s.decide(marker)?,
        };

        tracing::debug!(
            marker,
            save = instruction.save_current,
            delete = ?instruction.checkpoints_to_delete,
            "Checkpoint instruction"
        );
        Ok(instruction)
    }

    /// Continue a warm-started run: the resumed checkpoint joins the retention
    /// window and later markers must exceed it.
    pub fn resume_from(&mut self, marker: u64) {
        match self {
            CheckpointingStrategy::SaveEveryKSteps(s) => {
                s.progress.last = Some(marker);
            }
            CheckpointingStrategy::SaveKMostRecent(s) => {
                s.progress.last = Some(marker);
                if s.retention != Retention::Never {
                    s.window = vec![marker];
                }
            }
        }
    }

    /// Undo the window changes of an instruction whose save did not happen:
    /// drop `marker` and take back the markers it proposed to delete.
    pub fn rollback(&mut self, instruction: &CheckpointInstruction, marker: u64) {
        if let CheckpointingStrategy::SaveKMostRecent(s) = self {
            if instruction.save_current {
                s.window.retain(|&m| m != marker);
            }
            s.window
                .extend(instruction.checkpoints_to_delete.iter().copied());
            s.window.sort_unstable();
            s.window.dedup();
        }
    }

    /// Markers of checkpoints currently retained, oldest first. Empty for
    /// policies that never delete.
    pub fn retained(&self) -> &[u64] {
        match self {
            CheckpointingStrategy::SaveEveryKSteps(_) => &[],
            CheckpointingStrategy::SaveKMostRecent(s) => &s.window,
        }
    }

    /// Last marker passed to `decide` (or resumed from).
    pub fn last_marker(&self) -> Option<u64> {
        match self {
            CheckpointingStrategy::SaveEveryKSteps(s) => s.progress.last,
            CheckpointingStrategy::SaveKMostRecent(s) => s.progress.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every(k: i64) -> CheckpointingStrategy {
        CheckpointingStrategy::from_config(&StrategyConfig::SaveEveryKSteps { k }).unwrap()
    }

    fn recent(k: i64) -> CheckpointingStrategy {
        CheckpointingStrategy::from_config(&StrategyConfig::SaveKMostRecent { k, interval: 1 })
            .unwrap()
    }

    #[test]
    fn test_save_every_k_steps() {
        let mut s = every(100);
        let saves: Vec<bool> = [50, 100, 150, 200]
            .iter()
            .map(|&m| s.decide(m).unwrap().save_current)
            .collect();
        assert_eq!(saves, vec![false, true, false, true]);
        assert!(s.retained().is_empty());
    }

    #[test]
    fn test_save_every_k_steps_rejects_non_positive_k() {
        for k in [0, -1, -100] {
            let err = CheckpointingStrategy::from_config(&StrategyConfig::SaveEveryKSteps { k })
                .unwrap_err();
            assert!(matches!(err, CheckpointError::Configuration(_)));
        }
    }

    #[test]
    fn test_k_most_recent_fifo() {
        let mut s = recent(2);
        assert_eq!(s.decide(10).unwrap(), CheckpointInstruction::save());
        assert_eq!(s.decide(20).unwrap(), CheckpointInstruction::save());

        let third = s.decide(30).unwrap();
        assert!(third.save_current);
        assert_eq!(third.checkpoints_to_delete, vec![10]);
        assert_eq!(s.retained(), &[20, 30]);
    }

    #[test]
    fn test_k_most_recent_special_values() {
        let mut never = recent(0);
        for m in 1..5 {
            assert!(never.decide(m).unwrap().is_noop());
        }
        assert!(never.retained().is_empty());

        let mut all = recent(-1);
        for m in 1..=50 {
            assert!(all.decide(m).unwrap().checkpoints_to_delete.is_empty());
        }
        assert_eq!(all.retained().len(), 50);

        assert!(matches!(
            CheckpointingStrategy::from_config(&StrategyConfig::SaveKMostRecent {
                k: -2,
                interval: 1
            }),
            Err(CheckpointError::Configuration(_))
        ));
    }

    #[test]
    fn test_k_most_recent_interval() {
        let mut s =
            CheckpointingStrategy::from_config(&StrategyConfig::SaveKMostRecent { k: 1, interval: 5 })
                .unwrap();
        assert!(!s.decide(3).unwrap().save_current);
        assert!(s.decide(5).unwrap().save_current);
        assert!(!s.decide(7).unwrap().save_current);
        assert_eq!(s.decide(10).unwrap().checkpoints_to_delete, vec![5]);
    }

    #[test]
    fn test_rejects_non_monotonic_markers() {
        for mut s in [every(10), recent(2)] {
            s.decide(20).unwrap();
            let err = s.decide(20).unwrap_err();
            assert!(matches!(
                err,
                CheckpointError::NonMonotonicProgress {
                    previous: 20,
                    current: 20
                }
            ));
            assert!(s.decide(10).is_err());
            assert_eq!(s.last_marker(), Some(20));
        }
    }

    #[test]
    fn test_rejected_marker_leaves_window_untouched() {
        let mut s = recent(2);
        s.decide(10).unwrap();
        s.decide(20).unwrap();
        assert!(s.decide(15).is_err());
        assert_eq!(s.retained(), &[10, 20]);
    }

    #[test]
    fn test_resume_from_seeds_window() {
        let mut s = recent(2);
        s.resume_from(999);
        assert_eq!(s.retained(), &[999]);
        assert!(s.decide(999).is_err());

        s.decide(1999).unwrap();
        let instruction = s.decide(2999).unwrap();
        assert_eq!(instruction.checkpoints_to_delete, vec![999]);
    }

    #[test]
    fn test_rollback_restores_window() {
        let mut s = recent(2);
        s.decide(10).unwrap();
        s.decide(20).unwrap();
        let instruction = s.decide(30).unwrap();
        assert_eq!(s.retained(), &[20, 30]);

        s.rollback(&instruction, 30);
        assert_eq!(s.retained(), &[10, 20]);

        // The next save retires the surplus.
        let next = s.decide(40).unwrap();
        assert_eq!(next.checkpoints_to_delete, vec![10]);
        assert_eq!(s.retained(), &[20, 40]);
    }

    #[test]
    fn test_config_serde() {
        let config: StrategyConfig =
            toml::from_str("kind = \"save_k_most_recent\"\nk = 4").unwrap();
        assert_eq!(config, StrategyConfig::SaveKMostRecent { k: 4, interval: 1 });

        let config: StrategyConfig =
            toml::from_str("kind = \"save_every_k_steps\"\nk = 100").unwrap();
        assert_eq!(config, StrategyConfig::SaveEveryKSteps { k: 100 });
    }
}
