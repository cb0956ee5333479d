//! Bitonic sorting networks over a [`Communicator`] of any size.
//!
//! Groups whose size is a power of two run the classic binary network. Any
//! other group is cut into its largest power-of-two prefix and a remainder,
//! both halves are sorted (the remainder recursively), the remainder's
//! partitions are folded into the prefix with one merge step, and the two
//! halves are sorted once more.

use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::comm::{Communicator, Tag};
use crate::error::SortError;
use crate::exchange::{Direction, ExchangeOptions, exchange_and_merge};
use crate::timing::TimingTracker;
use crate::topology::{is_power_two, power_two_below};

/// Anything the distributed sort can move between workers.
pub trait SortElement: Serialize + DeserializeOwned + Clone + Send + Sync {}

impl<T> SortElement for T where T: Serialize + DeserializeOwned + Clone + Send + Sync {}

/// Phases of one sort, as recorded by the [`TimingTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    LocalSort,
    /// Binary network on a power-of-two group
    BinaryNetwork,
    /// Recursive sort of the non-power-of-two remainder
    RecursiveRemainder,
    MergeIncreasing,
    /// Second sort of both halves after the merge step
    FinalPass,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::LocalSort => "local-sort",
            Phase::BinaryNetwork => "binary-network",
            Phase::RecursiveRemainder => "recursive-remainder",
            Phase::MergeIncreasing => "merge-increasing",
            Phase::FinalPass => "final-pass",
        };
        write!(f, "{}", name)
    }
}

/// State threaded through one sort on one worker.
pub(crate) struct SortContext<'a, F> {
    pub compare: &'a F,
    pub options: ExchangeOptions,
    pub parallel_local_sort: bool,
    pub timing: TimingTracker,
    pub depth: usize,
}

impl<'a, F> SortContext<'a, F> {
    pub(crate) fn new(
        compare: &'a F,
        options: ExchangeOptions,
        parallel_local_sort: bool,
        timing: TimingTracker,
    ) -> Self {
        SortContext {
            compare,
            options,
            parallel_local_sort,
            timing,
            depth: 0,
        }
    }

    async fn exchange<C, T>(
        &mut self,
        comm: &C,
        partner: usize,
        tag: Tag,
        data: &mut Vec<T>,
        direction: Direction,
    ) -> Result<(), SortError>
    where
        C: Communicator,
        T: SortElement,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let start = Instant::now();
        let stats =
            exchange_and_merge(comm, partner, tag, data, direction, self.compare, self.options)
                .await?;
        self.timing
            .record_exchange(tag, self.depth, stats, start.elapsed());
        Ok(())
    }

    fn record(&mut self, phase: Phase, group_size: usize, start: Instant) {
        self.timing
            .record_phase(phase, self.depth, group_size, start.elapsed());
    }
}

/// Sorts one partition in place, in parallel when built with `rayon`.
pub fn local_sort<T, F>(data: &mut [T], compare: &F, parallel: bool)
where
    T: Send,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    #[cfg(feature = "rayon")]
    {
        if parallel {
            use rayon::prelude::*;
            data.par_sort_by(|a, b| compare(a, b));
            return;
        }
    }
    #[cfg(not(feature = "rayon"))]
    let _ = parallel;
    data.sort_by(|a, b| compare(a, b));
}

/// The partner-side rule of the binary network: at stage `stage`, the pair
/// keeps its low half on the lower rank when the stage bit is clear and on
/// the higher rank when it is set.
pub fn network_direction(rank: usize, partner: usize, stage: usize) -> Direction {
    let lower = rank < partner;
    let stage_bit_clear = rank & stage == 0;
    if lower == stage_bit_clear {
        Direction::Down
    } else {
        Direction::Up
    }
}

/// Binary bitonic network. Every partition must already be locally sorted
/// and the group size must be a power of two.
pub(crate) async fn bitonic_sort_binary<C, T, F>(
    comm: &C,
    data: &mut Vec<T>,
    ctx: &mut SortContext<'_, F>,
) -> Result<(), SortError>
where
    C: Communicator,
    T: SortElement,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    let size = comm.size();
    let rank = comm.rank();
    if !is_power_two(size) {
        return Err(SortError::Topology(format!(
            "binary network needs a power-of-two group, got {}",
            size
        )));
    }

    let mut stage = 2;
    while stage <= size {
        let mut step = stage / 2;
        while step > 0 {
            let partner = rank ^ step;
            let tag = Tag::Network {
                stage: stage as u32,
                step: step as u32,
            };
            ctx.exchange(comm, partner, tag, data, network_direction(rank, partner, stage))
                .await?;
            step /= 2;
        }
        stage *= 2;
    }
    Ok(())
}

/// Folds a sorted remainder into a sorted power-of-two prefix.
///
/// The last `size - p` ranks of the prefix each pair with one remainder rank
/// (`rank + (size - p)`), keeping the low half; everyone else idles.
pub(crate) async fn bitonic_merge_increasing<C, T, F>(
    comm: &C,
    data: &mut Vec<T>,
    ctx: &mut SortContext<'_, F>,
) -> Result<(), SortError>
where
    C: Communicator,
    T: SortElement,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    let size = comm.size();
    let rank = comm.rank();
    let num_left = power_two_below(size);
    let num_right = size - num_left;

    if rank < num_left && rank >= num_left - num_right {
        ctx.exchange(comm, rank + num_right, Tag::MergeIncreasing, data, Direction::Down)
            .await
    } else if rank >= num_left {
        ctx.exchange(comm, rank - num_right, Tag::MergeIncreasing, data, Direction::Up)
            .await
    } else {
        Ok(())
    }
}

async fn sort_half<C, T, F>(
    comm: &C,
    in_power_two: bool,
    data: &mut Vec<T>,
    ctx: &mut SortContext<'_, F>,
) -> Result<(), SortError>
where
    C: Communicator,
    T: SortElement,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    if in_power_two {
        bitonic_sort_binary(comm, data, ctx).await
    } else {
        ctx.depth += 1;
        let result = sort_group(comm, data, ctx).await;
        ctx.depth -= 1;
        result
    }
}

/// Sorts the group's partitions so that their rank-order concatenation is
/// ascending. Every member must call it and every partition must be
/// non-empty.
pub(crate) fn sort_group<'a, 'f, C, T, F>(
    comm: &'a C,
    data: &'a mut Vec<T>,
    ctx: &'a mut SortContext<'f, F>,
) -> BoxFuture<'a, Result<(), SortError>>
where
    'f: 'a,
    C: Communicator,
    T: SortElement + 'a,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    async move {
        let size = comm.size();
        let rank = comm.rank();

        let start = Instant::now();
        local_sort(data, ctx.compare, ctx.parallel_local_sort);
        ctx.record(Phase::LocalSort, size, start);

        if is_power_two(size) {
            let start = Instant::now();
            bitonic_sort_binary(comm, data, ctx).await?;
            ctx.record(Phase::BinaryNetwork, size, start);
            return Ok(());
        }

        let num_left = power_two_below(size);
        let in_power_two = rank < num_left;
        debug!(
            "[Bitonic] depth {} rank {}/{}: prefix {} remainder {}",
            ctx.depth,
            rank,
            size,
            num_left,
            size - num_left
        );

        // the remainder is ranked back to front so its high end meets the
        // prefix's high end in the merge step
        let key = if in_power_two { rank } else { size - rank - 1 };
        let half = comm.split(in_power_two as u32, key, ctx.options.timeout).await?;
        let start = Instant::now();
        sort_half(&half, in_power_two, data, ctx).await?;
        let phase = if in_power_two {
            Phase::BinaryNetwork
        } else {
            Phase::RecursiveRemainder
        };
        ctx.record(phase, half.size(), start);

        let start = Instant::now();
        bitonic_merge_increasing(comm, data, ctx).await?;
        ctx.record(Phase::MergeIncreasing, size, start);

        let half = comm.split(in_power_two as u32, rank, ctx.options.timeout).await?;
        let start = Instant::now();
        sort_half(&half, in_power_two, data, ctx).await?;
        ctx.record(Phase::FinalPass, half.size(), start);
        Ok(())
    }
    .boxed()
}
