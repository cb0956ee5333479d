use std::cmp::Ordering;
use std::io;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bitonic::{SortContext, SortElement, sort_group};
use crate::codec::{decode_items, encode_items};
use crate::comm::{Communicator, Tag, all_gather, all_of, recv_within};
use crate::config::SortConfig;
use crate::error::{CommError, SortError};
use crate::exchange::ExchangeOptions;
use crate::timing::TimingTracker;

/// Drives the distributed bitonic sort on one worker.
///
/// Every worker of a group builds its own `DistributedSorter` and calls
/// [`DistributedSorter::sort_by`] with the same communicator group and the
/// same comparison. On return the worker's partition holds its slice of the
/// global order: the rank-order concatenation of all partitions is sorted and
/// holds exactly the input elements. Individual partition sizes may shift
/// between workers, but no partition ends up empty.
///
/// # Example
///
/// ```rust,no_run
/// # use distsort_core::comm::local::LocalFabric;
/// # use distsort_core::config::SortConfig;
/// # use distsort_core::sorter::DistributedSorter;
/// # async fn example() -> Result<(), distsort_core::error::SortError> {
/// let fabric = LocalFabric::new(1);
/// let comm = fabric.world().remove(0);
/// let mut data = vec![3, 1, 2];
/// let mut sorter = DistributedSorter::new(SortConfig::default());
/// sorter.sort(&comm, &mut data).await?;
/// assert_eq!(data, vec![1, 2, 3]);
/// # Ok(())
/// # }
/// ```
pub struct DistributedSorter {
    config: SortConfig,
    timing_tracker: TimingTracker,
}

impl DistributedSorter {
    pub fn new(config: SortConfig) -> Self {
        DistributedSorter {
            config,
            timing_tracker: TimingTracker::new(),
        }
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Sorts ascending by the element's natural order.
    pub async fn sort<C, T>(&mut self, comm: &C, data: &mut Vec<T>) -> Result<(), SortError>
    where
        C: Communicator,
        T: SortElement + Ord,
    {
        self.sort_by(comm, data, T::cmp).await
    }

    /// Sorts ascending under `compare`, which must be a strict weak ordering
    /// and identical on every worker.
    ///
    /// Any failure other than a remote abort is broadcast to the rest of the
    /// world before it is returned, so no peer is left blocked on this worker.
    /// An empty partition anywhere fails every worker with the same
    /// [`SortError::EmptyPartition`] before any data moves.
    pub async fn sort_by<C, T, F>(
        &mut self,
        comm: &C,
        data: &mut Vec<T>,
        compare: F,
    ) -> Result<(), SortError>
    where
        C: Communicator,
        T: SortElement,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let result = self.run(comm, data, &compare).await;
        if let Err(e) = &result {
            match e {
                // every worker reached the same verdict from the vote
                SortError::EmptyPartition { .. } => {}
                e if e.is_remote_abort() => {
                    warn!("[DistributedSorter] rank {} stopping: {}", comm.rank(), e);
                }
                e => {
                    warn!("[DistributedSorter] rank {} failed: {}", comm.rank(), e);
                    comm.abort(&e.to_string()).await;
                }
            }
        }
        result
    }

    async fn run<C, T, F>(&mut self, comm: &C, data: &mut Vec<T>, compare: &F) -> Result<(), SortError>
    where
        C: Communicator,
        T: SortElement,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        let size = comm.size();
        let rank = comm.rank();
        if size == 0 {
            return Err(SortError::Topology("group has no workers".to_string()));
        }
        if rank >= size {
            return Err(SortError::Topology(format!(
                "rank {} outside a group of size {}",
                rank, size
            )));
        }

        let timeout = self.config.exchange_timeout();
        let counts = all_gather(comm, Tag::Vote, &(data.len() as u64), timeout).await?;
        let empty: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(r, _)| r)
            .collect();
        if !empty.is_empty() {
            return Err(SortError::EmptyPartition { ranks: empty });
        }
        let total: u64 = counts.iter().sum();
        info!(
            "[DistributedSorter] rank {}/{} sorting {} of {} elements",
            rank,
            size,
            data.len(),
            total
        );

        let options = ExchangeOptions {
            timeout,
            compress: self.config.compress,
        };
        let mut ctx = SortContext::new(
            compare,
            options,
            self.config.parallel_local_sort,
            std::mem::take(&mut self.timing_tracker),
        );
        let result = sort_group(comm, data, &mut ctx).await;
        self.timing_tracker = ctx.timing;
        result?;

        info!(
            "[DistributedSorter] rank {}/{} done, holding {} elements",
            rank,
            size,
            data.len()
        );
        Ok(())
    }

    pub fn timing_tracker_mut(&mut self) -> &mut TimingTracker {
        &mut self.timing_tracker
    }

    pub fn timing_tracker(&self) -> &TimingTracker {
        &self.timing_tracker
    }

    /// Writes `{filename_prefix}_phases.csv` and `{filename_prefix}_exchanges.csv`.
    pub fn export_all_timings(&self, filename_prefix: &str) -> io::Result<()> {
        let phase_filename = format!("{}_phases.csv", filename_prefix);
        let exchange_filename = format!("{}_exchanges.csv", filename_prefix);

        self.timing_tracker
            .write_phase_timings_to_csv(&phase_filename)?;
        self.timing_tracker
            .write_exchange_timings_to_csv(&exchange_filename)?;

        info!("[DistributedSorter] Exported phase timings to: {}", phase_filename);
        info!("[DistributedSorter] Exported exchange timings to: {}", exchange_filename);
        Ok(())
    }

    pub fn print_timing_summary(&self) {
        info!("=== Phase Timing Summary ===");
        for (phase, (avg, max, count)) in self.timing_tracker.get_phase_statistics() {
            info!(
                "{}: avg={:.2}ms, max={:.2}ms, count={}",
                phase, avg, max, count
            );
        }
        info!("=== Exchange Timing Summary ===");
        for (kind, (avg, max, count)) in self.timing_tracker.get_exchange_statistics() {
            info!(
                "{}: avg={:.2}ms, max={:.2}ms, count={}",
                kind, avg, max, count
            );
        }
    }
}

/// Sorts `data` across `comm` with the default configuration.
pub async fn bitonic_sort<C, T>(comm: &C, data: &mut Vec<T>) -> Result<(), SortError>
where
    C: Communicator,
    T: SortElement + Ord,
{
    DistributedSorter::new(SortConfig::default())
        .sort(comm, data)
        .await
}

/// Sorts `data` across `comm` under `compare` with the default configuration.
pub async fn bitonic_sort_by<C, T, F>(comm: &C, data: &mut Vec<T>, compare: F) -> Result<(), SortError>
where
    C: Communicator,
    T: SortElement,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    DistributedSorter::new(SortConfig::default())
        .sort_by(comm, data, compare)
        .await
}

/// Collective check that the rank-order concatenation of all partitions is
/// ascending under the natural order.
pub async fn is_sorted<C, T>(
    comm: &C,
    data: &[T],
    timeout: Option<Duration>,
) -> Result<bool, CommError>
where
    C: Communicator,
    T: SortElement + Ord,
{
    is_sorted_by(comm, data, T::cmp, timeout).await
}

/// Collective check that the rank-order concatenation of all partitions is
/// ascending under `compare`.
///
/// Each worker receives the largest element held by any lower rank, checks it
/// against its own first element, and forwards its own largest element (or
/// the one it received, when its partition is empty) to the next rank.
pub async fn is_sorted_by<C, T, F>(
    comm: &C,
    data: &[T],
    compare: F,
    timeout: Option<Duration>,
) -> Result<bool, CommError>
where
    C: Communicator,
    T: SortElement,
    F: Fn(&T, &T) -> Ordering + Sync,
{
    let rank = comm.rank();
    let mut ok = data
        .windows(2)
        .all(|w| compare(&w[0], &w[1]) != Ordering::Greater);

    let mut carried: Option<T> = None;
    if rank > 0 {
        let payload = recv_within(comm, rank - 1, Tag::Shift, timeout).await?;
        carried = decode_items::<T>(&payload, rank - 1).await?.pop();
    }
    if let (Some(prev), Some(first)) = (&carried, data.first()) {
        if compare(prev, first) == Ordering::Greater {
            debug!("[DistributedSorter] rank {} starts below rank {}'s tail", rank, rank - 1);
            ok = false;
        }
    }
    if rank + 1 < comm.size() {
        let tail: Vec<T> = data.last().cloned().or(carried).into_iter().collect();
        let payload = encode_items(&tail, false).await?;
        comm.send(rank + 1, Tag::Shift, payload).await?;
    }

    all_of(comm, ok, timeout).await
}
