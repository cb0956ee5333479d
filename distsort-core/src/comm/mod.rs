//! Message-passing substrate the sort runs on.
//!
//! A [`Communicator`] is an ordered group of workers that can exchange tagged
//! byte frames pairwise and split into re-ranked sub-groups. Two transports
//! implement it: [`local::LocalCommunicator`] for in-process workers and
//! [`tcp::TcpCommunicator`] for one worker per OS process.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::BINCODE_CONFIG;
use crate::error::CommError;

pub mod local;
pub mod tcp;

/// Stage-specific message tag. A frame is only accepted by a receive posted
/// with the same tag, so consecutive network stages can never cross-match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Stage `stage` (bitonic block size), sub-step `step` (partner distance)
    Network { stage: u32, step: u32 },
    MergeIncreasing,
    /// `seq`-th split on a communicator
    Gather { seq: u64 },
    Vote,
    Shift,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Frame {
    pub(crate) fn accept(self, partner: usize, expected: Tag) -> Result<Vec<u8>, CommError> {
        if self.tag != expected {
            return Err(CommError::TagMismatch {
                partner,
                expected,
                found: self.tag,
            });
        }
        Ok(self.payload)
    }
}

/// Reason a world was torn down, as seen by every surviving worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AbortNotice {
    pub rank: usize,
    pub reason: String,
}

impl From<AbortNotice> for CommError {
    fn from(notice: AbortNotice) -> Self {
        CommError::Aborted {
            rank: notice.rank,
            reason: notice.reason,
        }
    }
}

/// A group of workers with SPMD semantics.
///
/// Handles are never re-ranked in place: [`Communicator::split`] returns a
/// fresh handle sharing the parent's transport.
#[async_trait]
pub trait Communicator: Send + Sync + Sized {
    /// Rank of the calling worker within this group
    fn rank(&self) -> usize;

    /// Number of workers in this group
    fn size(&self) -> usize;

    /// Rank of the calling worker in the world the group was split from
    fn world_rank(&self) -> usize;

    /// Sends `payload` to `dest`. Returns once the frame is handed to the
    /// transport; it does not wait for the matching receive.
    async fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), CommError>;

    /// Blocks until the next frame from `src` arrives and checks its tag.
    async fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>, CommError>;

    /// Collective: every member calls it with its colour and ordering key.
    /// Members sharing a colour form the new group, ranked by `(key, rank)`.
    /// `timeout` bounds each receive of the underlying gather.
    async fn split(
        &self,
        color: u32,
        key: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, CommError>;

    /// Tells every worker in the world to stop waiting. Best effort.
    async fn abort(&self, reason: &str);
}

pub(crate) fn check_peer(rank: usize, size: usize) -> Result<(), CommError> {
    if rank >= size {
        return Err(CommError::RankOutOfRange { rank, size });
    }
    Ok(())
}

/// [`Communicator::recv`] bounded by an optional timeout.
pub async fn recv_within<C: Communicator>(
    comm: &C,
    src: usize,
    tag: Tag,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, CommError> {
    match timeout {
        Some(after) => tokio::time::timeout(after, comm.recv(src, tag))
            .await
            .map_err(|_| CommError::Timeout {
                partner: src,
                after,
            })?,
        None => comm.recv(src, tag).await,
    }
}

/// Every member contributes `value`; every member gets all values in rank order.
pub async fn all_gather<C, V>(
    comm: &C,
    tag: Tag,
    value: &V,
    timeout: Option<Duration>,
) -> Result<Vec<V>, CommError>
where
    C: Communicator,
    V: Serialize + DeserializeOwned + Clone,
{
    let me = comm.rank();
    let bytes = bincode::serde::encode_to_vec(value, BINCODE_CONFIG)?;
    for dest in (0..comm.size()).filter(|&r| r != me) {
        comm.send(dest, tag, bytes.clone()).await?;
    }
    let mut values = Vec::with_capacity(comm.size());
    for src in 0..comm.size() {
        if src == me {
            values.push(value.clone());
            continue;
        }
        let payload = recv_within(comm, src, tag, timeout).await?;
        let (v, _): (V, _) = bincode::serde::decode_from_slice(&payload, BINCODE_CONFIG)?;
        values.push(v);
    }
    Ok(values)
}

/// Logical AND of `flag` across the group.
pub async fn all_of<C: Communicator>(
    comm: &C,
    flag: bool,
    timeout: Option<Duration>,
) -> Result<bool, CommError> {
    let flags = all_gather(comm, Tag::Vote, &flag, timeout).await?;
    Ok(flags.into_iter().all(|f| f))
}

/// Shared half of every `split` implementation: gathers `(color, key)` from
/// the whole group and returns the parent ranks of the caller's new group in
/// their new rank order.
pub(crate) async fn gather_split<C: Communicator>(
    comm: &C,
    seq: u64,
    color: u32,
    key: usize,
    timeout: Option<Duration>,
) -> Result<Vec<usize>, CommError> {
    let entries: Vec<(u32, u64)> =
        all_gather(comm, Tag::Gather { seq }, &(color, key as u64), timeout).await?;
    let mut members: Vec<(u64, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(_, (c, _))| *c == color)
        .map(|(rank, (_, k))| (*k, rank))
        .collect();
    let mut seen = HashSet::new();
    if let Some((dup, _)) = members.iter().find(|(k, _)| !seen.insert(*k)) {
        return Err(CommError::InconsistentSplit(format!(
            "key {} used twice within colour {}",
            dup, color
        )));
    }
    members.sort();
    Ok(members.into_iter().map(|(_, rank)| rank).collect())
}

pub(crate) fn child_context(parent: &str, seq: u64, color: u32) -> String {
    format!("{}/{}:{}", parent, seq, color)
}
