//! Rank-collective communication.
//!
//! Every collective is blocking and barrier-like: all ranks must call the same
//! operation, with the same root, in the same order. A rank that skips a call
//! stalls its peers indefinitely.
//!
//! Payloads travel as bytes. The typed helpers (`gather`, `scatter`,
//! `broadcast`) encode with bincode, which doubles as the host offload of any
//! state before it leaves a rank.

mod thread;

pub use thread::{launch, SyncGroup, ThreadCollective};

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("Peer disconnected during {0}")]
    Disconnected(&'static str),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Trait for rank-collective communication
pub trait Collective: Send {
    /// Get current rank
    fn rank(&self) -> usize;

    /// Get world size
    fn world_size(&self) -> usize;

    /// Every rank contributes one payload. `root` receives all of them in rank
    /// order; other ranks receive `None`.
    fn gather_bytes(
        &self,
        root: usize,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>, CollectiveError>;

    /// `root` supplies one payload per rank; every rank receives its own.
    /// Non-root ranks pass `None`.
    fn scatter_bytes(
        &self,
        root: usize,
        payloads: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, CollectiveError>;

    /// `root` supplies a payload that every rank receives.
    /// Non-root ranks pass `None`.
    fn broadcast_bytes(
        &self,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CollectiveError>;

    /// Barrier synchronization
    fn barrier(&self);

    /// Check if this rank is `root`
    fn is_root(&self, root: usize) -> bool {
        self.rank() == root
    }

    /// Typed gather.
    fn gather<T>(&self, root: usize, value: &T) -> Result<Option<Vec<T>>, CollectiveError>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        let payload = bincode::serialize(value)?;
        match self.gather_bytes(root, payload)? {
            Some(payloads) => {
                let values = payloads
                    .iter()
                    .map(|bytes| bincode::deserialize(bytes))
                    .collect::<Result<Vec<T>, _>>()?;
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    /// Typed scatter.
    fn scatter<T>(&self, root: usize, values: Option<Vec<T>>) -> Result<T, CollectiveError>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        let payloads = match values {
            Some(values) => Some(
                values
                    .iter()
                    .map(bincode::serialize)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        let bytes = self.scatter_bytes(root, payloads)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Typed broadcast.
    fn broadcast<T>(&self, root: usize, value: Option<T>) -> Result<T, CollectiveError>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        let payload = match value {
            Some(v) => Some(bincode::serialize(&v)?),
            None => None,
        };
        let bytes = self.broadcast_bytes(root, payload)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Collective for a single-rank run. Every operation is local.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoloCollective;

impl SoloCollective {
    pub fn new() -> Self {
        Self
    }
}

fn check_root(root: usize, world_size: usize) -> Result<(), CollectiveError> {
    if root >= world_size {
        return Err(CollectiveError::Protocol(format!(
            "root rank {} out of range for world size {}",
            root, world_size
        )));
    }
    Ok(())
}

impl Collective for SoloCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn gather_bytes(
        &self,
        root: usize,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>, CollectiveError> {
        check_root(root, 1)?;
        Ok(Some(vec![payload]))
    }

    fn scatter_bytes(
        &self,
        root: usize,
        payloads: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, CollectiveError> {
        check_root(root, 1)?;
        let mut payloads = payloads
            .ok_or_else(|| CollectiveError::Protocol("root supplied no scatter payloads".into()))?;
        if payloads.len() != 1 {
            return Err(CollectiveError::Protocol(format!(
                "expected 1 scatter payload, got {}",
                payloads.len()
            )));
        }
        Ok(payloads.remove(0))
    }

    fn broadcast_bytes(
        &self,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CollectiveError> {
        check_root(root, 1)?;
        payload.ok_or_else(|| CollectiveError::Protocol("root supplied no broadcast payload".into()))
    }

    fn barrier(&self) {}
}
