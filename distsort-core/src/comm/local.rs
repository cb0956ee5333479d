//! In-process transport: every worker is a tokio task, every directed pair of
//! workers per communicator context gets its own unbounded channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{AbortNotice, Communicator, Frame, Tag, check_peer, child_context, gather_split};
use crate::error::CommError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MailboxKey {
    context: String,
    src: usize,
    dst: usize,
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

/// Shared switchboard for a world of in-process workers.
pub struct LocalFabric {
    size: usize,
    mailboxes: Mutex<HashMap<MailboxKey, Mailbox>>,
    abort: watch::Sender<Option<AbortNotice>>,
    _abort_rx: watch::Receiver<Option<AbortNotice>>,
}

impl LocalFabric {
    pub fn new(size: usize) -> Arc<Self> {
        let (abort, abort_rx) = watch::channel(None);
        Arc::new(LocalFabric {
            size,
            mailboxes: Mutex::new(HashMap::new()),
            abort,
            _abort_rx: abort_rx,
        })
    }

    /// One world communicator per rank, in rank order.
    pub fn world(self: &Arc<Self>) -> Vec<LocalCommunicator> {
        let members: Arc<Vec<usize>> = Arc::new((0..self.size).collect());
        (0..self.size)
            .map(|rank| LocalCommunicator {
                fabric: Arc::clone(self),
                context: "world".to_string(),
                members: Arc::clone(&members),
                rank,
                splits: AtomicU64::new(0),
                owns_context: false,
            })
            .collect()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Fails every pending and future receive on this fabric. The first
    /// notice wins.
    pub fn abort(&self, rank: usize, reason: &str) {
        self.abort.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(AbortNotice {
                rank,
                reason: reason.to_string(),
            });
            true
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.borrow().is_some()
    }

    fn with_mailbox<R>(&self, key: MailboxKey, f: impl FnOnce(&Mailbox) -> R) -> R {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mailbox = mailboxes.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Mailbox {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        f(mailbox)
    }

    /// Drops the mailboxes `dst` reads from in `context`.
    fn release(&self, context: &str, dst: usize) {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mailboxes.retain(|key, _| !(key.dst == dst && key.context == context));
    }

    #[cfg(test)]
    fn contexts(&self) -> std::collections::HashSet<String> {
        let mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mailboxes.keys().map(|key| key.context.clone()).collect()
    }
}

/// Handle on a [`LocalFabric`] group.
pub struct LocalCommunicator {
    fabric: Arc<LocalFabric>,
    context: String,
    /// World ranks of the members, indexed by rank in this group
    members: Arc<Vec<usize>>,
    rank: usize,
    splits: AtomicU64,
    /// Set on handles returned by `split`; their context dies with them
    owns_context: bool,
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        if self.owns_context {
            self.fabric.release(&self.context, self.world_rank());
        }
    }
}

impl LocalCommunicator {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    fn key(&self, src: usize, dst: usize) -> MailboxKey {
        MailboxKey {
            context: self.context.clone(),
            src: self.members[src],
            dst: self.members[dst],
        }
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    async fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), CommError> {
        check_peer(dest, self.size())?;
        let pending = self.fabric.abort.borrow().clone();
        if let Some(notice) = pending {
            return Err(notice.into());
        }
        let key = self.key(self.rank, dest);
        self.fabric
            .with_mailbox(key, |mailbox| mailbox.tx.send(Frame { tag, payload }))
            .map_err(|_| CommError::Disconnected { partner: dest })
    }

    async fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        check_peer(src, self.size())?;
        let key = self.key(src, self.rank);
        let rx = self.fabric.with_mailbox(key, |mailbox| Arc::clone(&mailbox.rx));
        let mut abort = self.fabric.abort.subscribe();
        let aborted = async move {
            match abort.wait_for(|notice| notice.is_some()).await {
                Ok(notice) => (*notice).clone(),
                Err(_) => None,
            }
        };
        let mut rx = rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame.accept(src, tag),
                None => Err(CommError::Disconnected { partner: src }),
            },
            notice = aborted => match notice {
                Some(notice) => Err(notice.into()),
                None => Err(CommError::Disconnected { partner: src }),
            },
        }
    }

    async fn split(
        &self,
        color: u32,
        key: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, CommError> {
        let seq = self.splits.fetch_add(1, Ordering::SeqCst);
        let parent_ranks = gather_split(self, seq, color, key, timeout).await?;
        let rank = parent_ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| CommError::InconsistentSplit("caller missing from its own colour".into()))?;
        let members: Vec<usize> = parent_ranks.iter().map(|&r| self.members[r]).collect();
        Ok(LocalCommunicator {
            fabric: Arc::clone(&self.fabric),
            context: child_context(&self.context, seq, color),
            members: Arc::new(members),
            rank,
            splits: AtomicU64::new(0),
            owns_context: true,
        })
    }

    async fn abort(&self, reason: &str) {
        self.fabric.abort(self.world_rank(), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::all_gather;

    #[tokio::test]
    async fn test_tagged_frames_arrive_in_order() {
        let fabric = LocalFabric::new(2);
        let world = fabric.world();
        let a = &world[0];
        let b = &world[1];
        let t1 = Tag::Network { stage: 2, step: 1 };
        let t2 = Tag::Network { stage: 4, step: 2 };
        a.send(1, t1, vec![1]).await.unwrap();
        a.send(1, t2, vec![2]).await.unwrap();
        assert_eq!(b.recv(0, t1).await.unwrap(), vec![1]);
        assert_eq!(b.recv(0, t2).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_wrong_tag_is_rejected() {
        let fabric = LocalFabric::new(2);
        let world = fabric.world();
        world[0].send(1, Tag::MergeIncreasing, vec![]).await.unwrap();
        let err = world[1]
            .recv(0, Tag::Network { stage: 2, step: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::TagMismatch { partner: 0, .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_partner() {
        let fabric = LocalFabric::new(2);
        let world = fabric.world();
        let err = world[0].send(2, Tag::Vote, vec![]).await.unwrap_err();
        assert!(matches!(err, CommError::RankOutOfRange { rank: 2, size: 2 }));
    }

    #[tokio::test]
    async fn test_abort_wakes_blocked_receiver() {
        let fabric = LocalFabric::new(2);
        let mut world = fabric.world();
        let b = world.pop().unwrap();
        let a = world.pop().unwrap();
        let waiting = tokio::spawn(async move { b.recv(0, Tag::Vote).await });
        tokio::task::yield_now().await;
        a.abort("partition unreadable").await;
        let err = waiting.await.unwrap().unwrap_err();
        match err {
            CommError::Aborted { rank, reason } => {
                assert_eq!(rank, 0);
                assert_eq!(reason, "partition unreadable");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(fabric.is_aborted());
    }

    #[tokio::test]
    async fn test_split_reverses_remainder() {
        let fabric = LocalFabric::new(5);
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let n = comm.size();
                    let low = comm.rank() < 4;
                    let key = if low { comm.rank() } else { n - comm.rank() - 1 };
                    let sub = comm.split(low as u32, key, None).await.unwrap();
                    // the sub-group must be usable on its own
                    let seen = all_gather(&sub, Tag::Vote, &comm.world_rank(), None)
                        .await
                        .unwrap();
                    (comm.rank(), sub.rank(), sub.size(), seen)
                })
            })
            .collect();
        for handle in handles {
            let (world_rank, sub_rank, sub_size, seen) = handle.await.unwrap();
            if world_rank < 4 {
                assert_eq!(sub_rank, world_rank);
                assert_eq!(sub_size, 4);
                assert_eq!(seen, vec![0, 1, 2, 3]);
            } else {
                assert_eq!(sub_rank, 0);
                assert_eq!(sub_size, 1);
                assert_eq!(seen, vec![4]);
            }
        }
    }

    #[tokio::test]
    async fn test_repeated_sorts_release_split_mailboxes() {
        let fabric = LocalFabric::new(3);
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    for round in 0..3i64 {
                        let mut data = vec![round * 10 - comm.rank() as i64, 5];
                        crate::sorter::bitonic_sort(&comm, &mut data).await.unwrap();
                    }
                    comm
                })
            })
            .collect();
        let mut world = Vec::new();
        for handle in handles {
            world.push(handle.await.unwrap());
        }
        let expected: std::collections::HashSet<String> = ["world".to_string()].into();
        assert_eq!(fabric.contexts(), expected);
        drop(world);
    }

    #[tokio::test]
    async fn test_split_rejects_duplicate_keys() {
        let fabric = LocalFabric::new(2);
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .map(|comm| tokio::spawn(async move { comm.split(0, 0, None).await.map(|_| ()) }))
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, CommError::InconsistentSplit(_)));
        }
    }
}
