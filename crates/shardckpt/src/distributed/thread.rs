//! In-process collective: one thread per rank, connected by channels.

use super::{check_root, Collective, CollectiveError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// A synchronization group for thread-local ranks
pub struct SyncGroup {
    pub barrier: Arc<Barrier>,
    // Rank -> root: each rank owns one upward lane
    pub up_senders: Vec<Sender<Vec<u8>>>,
    pub up_receivers: Vec<Receiver<Vec<u8>>>,
    // Root -> rank: each rank owns one downward lane
    pub down_senders: Vec<Sender<Vec<u8>>>,
    pub down_receivers: Vec<Receiver<Vec<u8>>>,
}

impl SyncGroup {
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "World size must be > 0");

        let mut up_senders = Vec::with_capacity(world_size);
        let mut up_receivers = Vec::with_capacity(world_size);
        let mut down_senders = Vec::with_capacity(world_size);
        let mut down_receivers = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let (us, ur) = bounded(1);
            let (ds, dr) = bounded(1);
            up_senders.push(us);
            up_receivers.push(ur);
            down_senders.push(ds);
            down_receivers.push(dr);
        }

        Self {
            barrier: Arc::new(Barrier::new(world_size)),
            up_senders,
            up_receivers,
            down_senders,
            down_receivers,
        }
    }

    pub fn world_size(&self) -> usize {
        self.up_senders.len()
    }
}

/// Rank handle over a shared `SyncGroup`.
#[derive(Clone)]
pub struct ThreadCollective {
    rank: usize,
    group: Arc<SyncGroup>,
}

impl ThreadCollective {
    pub fn new(rank: usize, group: Arc<SyncGroup>) -> Self {
        assert!(rank < group.world_size(), "Rank out of range");
        Self { rank, group }
    }

    /// One handle per rank over a fresh group.
    pub fn group(world_size: usize) -> Vec<Self> {
        let group = Arc::new(SyncGroup::new(world_size));
        (0..world_size)
            .map(|rank| Self::new(rank, Arc::clone(&group)))
            .collect()
    }

    fn send_up(&self, payload: Vec<u8>) -> Result<(), CollectiveError> {
        self.group.up_senders[self.rank]
            .send(payload)
            .map_err(|_| CollectiveError::Disconnected("send to root"))
    }

    fn recv_up(&self, from: usize) -> Result<Vec<u8>, CollectiveError> {
        self.group.up_receivers[from]
            .recv()
            .map_err(|_| CollectiveError::Disconnected("receive from rank"))
    }

    fn send_down(&self, to: usize, payload: Vec<u8>) -> Result<(), CollectiveError> {
        self.group.down_senders[to]
            .send(payload)
            .map_err(|_| CollectiveError::Disconnected("send to rank"))
    }

    fn recv_down(&self) -> Result<Vec<u8>, CollectiveError> {
        self.group.down_receivers[self.rank]
            .recv()
            .map_err(|_| CollectiveError::Disconnected("receive from root"))
    }

    /// Close a collective. Lanes are shared by every root, so no rank may start
    /// the next collective until all ranks have finished this one.
    fn settle<T>(&self, result: Result<T, CollectiveError>) -> Result<T, CollectiveError> {
        if result.is_ok() {
            self.group.barrier.wait();
        }
        result
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    fn gather_bytes(
        &self,
        root: usize,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>, CollectiveError> {
        let ws = self.world_size();
        check_root(root, ws)?;

        if self.rank == root {
            let mut own = Some(payload);
            let mut gathered = Vec::with_capacity(ws);
            for i in 0..ws {
                if i == root {
                    gathered.push(own.take().unwrap_or_default());
                } else {
                    gathered.push(self.recv_up(i)?);
                }
            }
            self.settle(Ok(Some(gathered)))
        } else {
            self.send_up(payload)?;
            self.settle(Ok(None))
        }
    }

    fn scatter_bytes(
        &self,
        root: usize,
        payloads: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>, CollectiveError> {
        let ws = self.world_size();
        check_root(root, ws)?;

        if self.rank == root {
            let payloads = payloads.ok_or_else(|| {
                CollectiveError::Protocol("root supplied no scatter payloads".into())
            })?;
            if payloads.len() != ws {
                return Err(CollectiveError::Protocol(format!(
                    "expected {} scatter payloads, got {}",
                    ws,
                    payloads.len()
                )));
            }

            let mut own = Vec::new();
            for (i, payload) in payloads.into_iter().enumerate() {
                if i == root {
                    own = payload;
                } else {
                    self.send_down(i, payload)?;
                }
            }
            self.settle(Ok(own))
        } else {
            self.settle(self.recv_down())
        }
    }

    fn broadcast_bytes(
        &self,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CollectiveError> {
        let ws = self.world_size();
        check_root(root, ws)?;

        if self.rank == root {
            let payload = payload.ok_or_else(|| {
                CollectiveError::Protocol("root supplied no broadcast payload".into())
            })?;
            for i in (0..ws).filter(|&i| i != root) {
                self.send_down(i, payload.clone())?;
            }
            self.settle(Ok(payload))
        } else {
            self.settle(self.recv_down())
        }
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }
}

/// Run `f` once per rank, each on its own thread, and collect the results in
/// rank order. A panic on any rank is re-raised on the caller.
pub fn launch<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ThreadCollective) -> T + Sync,
{
    let ranks = ThreadCollective::group(world_size);
    let f = &f;

    std::thread::scope(|scope| {
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|collective| scope.spawn(move || f(collective)))
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_collects_in_rank_order() {
        let results = launch(4, |c| c.gather(2, &(c.rank() as u32 * 10)).unwrap());

        for (rank, result) in results.iter().enumerate() {
            if rank == 2 {
                assert_eq!(result.as_deref(), Some(&[0, 10, 20, 30][..]));
            } else {
                assert!(result.is_none());
            }
        }
    }

    #[test]
    fn test_scatter_delivers_own_payload() {
        let results = launch(3, |c| {
            let values = c
                .is_root(1)
                .then(|| vec!["a".to_string(), "b".to_string(), "c".to_string()]);
            c.scatter::<String>(1, values).unwrap()
        });
        assert_eq!(results, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_broadcast_then_barrier() {
        let results = launch(3, |c| {
            let value = c.is_root(0).then_some(42u64);
            let got: u64 = c.broadcast(0, value).unwrap();
            c.barrier();
            got
        });
        assert_eq!(results, vec![42, 42, 42]);
    }

    #[test]
    fn test_sequence_of_collectives_with_different_roots() {
        let results = launch(3, |c| {
            let gathered = c.gather(0, &c.rank()).unwrap();
            let total: usize = c
                .broadcast(2, c.is_root(2).then_some(c.rank() * 100))
                .unwrap();
            (gathered.map(|g| g.iter().sum::<usize>()), total)
        });
        assert_eq!(results[0], (Some(3), 200));
        assert_eq!(results[1], (None, 200));
        assert_eq!(results[2], (None, 200));
    }

    #[test]
    fn test_alternating_broadcast_roots_stay_ordered() {
        let results = launch(4, |c| {
            (0..50u64)
                .map(|round| {
                    let root = (round % 3) as usize;
                    c.broadcast(root, c.is_root(root).then_some(round)).unwrap()
                })
                .collect::<Vec<u64>>()
        });
        for received in results {
            assert_eq!(received, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_root_payload_count_is_checked() {
        let group = ThreadCollective::group(1);
        let err = group[0].scatter_bytes(0, Some(vec![])).unwrap_err();
        assert!(matches!(err, CollectiveError::Protocol(_)));
    }
}
