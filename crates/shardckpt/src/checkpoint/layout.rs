//! On-disk naming and discovery.
//!
//! Artifacts live at
//! `<checkpoint_root>/<experiment_id>/eid_<experiment_id>-<entity>-num_samples_<marker + 1>.bin`.
//! The file name carries the one-indexed sample count; the progress marker is
//! recovered by subtracting one.

use super::instruction::EntityKind;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const FILE_EXTENSION: &str = "bin";

/// Resolves artifact paths for one experiment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointLayout {
    root: PathBuf,
    experiment_id: String,
}

impl CheckpointLayout {
    pub fn new(root: impl Into<PathBuf>, experiment_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            experiment_id: experiment_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Directory holding every artifact of the experiment.
    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join(&self.experiment_id)
    }

    /// File name of one artifact.
    pub fn file_name(&self, entity: EntityKind, marker: u64) -> String {
        format!(
            "eid_{}-{}-num_samples_{}.{}",
            self.experiment_id,
            entity,
            marker.saturating_add(1),
            FILE_EXTENSION
        )
    }

    /// Full path of one artifact.
    pub fn artifact_path(&self, entity: EntityKind, marker: u64) -> PathBuf {
        self.experiment_dir().join(self.file_name(entity, marker))
    }

    /// Recover `(entity, marker)` from an artifact file name of this experiment.
    pub fn parse_file_name(&self, name: &str) -> Option<(EntityKind, u64)> {
        let rest = name
            .strip_prefix("eid_")?
            .strip_prefix(self.experiment_id.as_str())?
            .strip_prefix('-')?
            .strip_suffix(FILE_EXTENSION)?
            .strip_suffix('.')?;

        let (entity, samples) = rest.split_once("-num_samples_")?;
        let entity: EntityKind = entity.parse().ok()?;
        let num_samples: u64 = samples.parse().ok()?;
        Some((entity, num_samples.checked_sub(1)?))
    }

    /// List every checkpoint of the experiment, complete or partial, ordered
    /// by marker. A missing experiment directory yields an empty list.
    pub fn scan(&self) -> io::Result<Vec<CheckpointListing>> {
        let entries = match fs::read_dir(self.experiment_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found: BTreeMap<u64, CheckpointListing> = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((entity, marker)) = name.to_str().and_then(|n| self.parse_file_name(n))
            else {
                continue;
            };

            let listing = found.entry(marker).or_insert_with(|| CheckpointListing {
                marker,
                model: None,
                optimizer: None,
            });
            match entity {
                EntityKind::Model => listing.model = Some(entry.path()),
                EntityKind::Optimizer => listing.optimizer = Some(entry.path()),
            }
        }

        Ok(found.into_values().collect())
    }

    /// Most recent checkpoint with both artifacts present.
    pub fn latest_complete(&self) -> io::Result<Option<CheckpointListing>> {
        Ok(self.scan()?.into_iter().rev().find(|c| c.is_complete()))
    }
}

/// One checkpoint found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointListing {
    pub marker: u64,
    pub model: Option<PathBuf>,
    pub optimizer: Option<PathBuf>,
}

impl CheckpointListing {
    /// Both artifacts exist. Only complete checkpoints are loadable.
    pub fn is_complete(&self) -> bool {
        self.model.is_some() && self.optimizer.is_some()
    }

    /// Entities whose artifact is absent.
    pub fn missing(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| self.path(*kind).is_none())
            .collect()
    }

    pub fn path(&self, entity: EntityKind) -> Option<&Path> {
        match entity {
            EntityKind::Model => self.model.as_deref(),
            EntityKind::Optimizer => self.optimizer.as_deref(),
        }
    }

    /// One-indexed sample count recorded in the file names.
    pub fn num_samples(&self) -> u64 {
        self.marker.saturating_add(1)
    }
}
