use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info};

use crate::bitonic::SortElement;
use crate::comm::local::{LocalCommunicator, LocalFabric};
use crate::config::SortConfig;
use crate::error::SortError;
use crate::sorter::DistributedSorter;

/// A world of in-process workers, one tokio task per rank, wired through a
/// fresh [`LocalFabric`] for every run.
///
/// # Example
///
/// ```rust,no_run
/// # use distsort_core::cluster::LocalCluster;
/// # async fn example() -> Result<(), distsort_core::error::SortError> {
/// let cluster = LocalCluster::new(3);
/// let sorted = cluster.sort(vec![vec![9], vec![3], vec![6]]).await?;
/// assert_eq!(sorted, vec![vec![3], vec![6], vec![9]]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LocalCluster {
    size: usize,
    config: SortConfig,
}

impl LocalCluster {
    pub fn new(size: usize) -> Self {
        LocalCluster {
            size,
            config: SortConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SortConfig) -> Self {
        self.config = config;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `worker` once per rank and returns the results in rank order.
    ///
    /// A worker task that panics aborts the fabric so its peers stop waiting,
    /// and the run fails with [`SortError::Worker`].
    pub async fn run<W, Fut, R>(&self, worker: W) -> Result<Vec<R>, SortError>
    where
        W: Fn(LocalCommunicator) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let inputs = vec![(); self.size];
        self.run_with(inputs, |comm, ()| worker(comm)).await
    }

    /// Like [`LocalCluster::run`], handing `inputs[r]` to rank `r`.
    pub async fn run_with<I, W, Fut, R>(&self, inputs: Vec<I>, worker: W) -> Result<Vec<R>, SortError>
    where
        W: Fn(LocalCommunicator, I) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        if self.size == 0 {
            return Err(SortError::Topology("cluster has no workers".to_string()));
        }
        if inputs.len() != self.size {
            return Err(SortError::Topology(format!(
                "{} inputs for a cluster of {} workers",
                inputs.len(),
                self.size
            )));
        }

        let fabric = LocalFabric::new(self.size);
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .zip(inputs)
            .map(|(comm, input)| tokio::spawn(worker(comm, input)))
            .collect();
        let waits = handles.into_iter().enumerate().map(|(rank, handle)| {
            let fabric = Arc::clone(&fabric);
            async move {
                let result = handle.await;
                if let Err(e) = &result {
                    error!("[LocalCluster] Worker {} failed: {}", rank, e);
                    fabric.abort(rank, &format!("worker task failed: {}", e));
                }
                result.map_err(|e| SortError::Worker(format!("rank {}: {}", rank, e)))
            }
        });
        join_all(waits).await.into_iter().collect()
    }

    /// Sorts `partitions[r]` on rank `r` by the natural order.
    pub async fn sort<T>(&self, partitions: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, SortError>
    where
        T: SortElement + Ord + 'static,
    {
        self.sort_by(partitions, T::cmp).await
    }

    /// Sorts `partitions[r]` on rank `r` under `compare` and returns the
    /// sorted partitions in rank order.
    ///
    /// When several workers fail, the error reported is the one that caused
    /// the abort rather than the aborts it triggered.
    pub async fn sort_by<T, F>(&self, partitions: Vec<Vec<T>>, compare: F) -> Result<Vec<Vec<T>>, SortError>
    where
        T: SortElement + 'static,
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        info!(
            "[LocalCluster] Sorting {} elements on {} workers",
            partitions.iter().map(Vec::len).sum::<usize>(),
            self.size
        );
        let compare = Arc::new(compare);
        let config = self.config.clone();
        let results = self
            .run_with(partitions, move |comm, mut data: Vec<T>| {
                let compare = Arc::clone(&compare);
                let config = config.clone();
                async move {
                    let mut sorter = DistributedSorter::new(config);
                    sorter
                        .sort_by(&comm, &mut data, |a, b| compare(a, b))
                        .await
                        .map(|_| data)
                }
            })
            .await?;

        let mut sorted = Vec::with_capacity(results.len());
        let mut first_error: Option<SortError> = None;
        for result in results {
            match result {
                Ok(data) => sorted.push(data),
                Err(e) => {
                    let replace = match &first_error {
                        None => true,
                        Some(current) => current.is_remote_abort() && !e.is_remote_abort(),
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(sorted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Communicator, Tag, all_gather};

    #[tokio::test]
    async fn test_run_collects_in_rank_order() {
        let cluster = LocalCluster::new(4);
        let ranks = cluster
            .run(|comm| async move {
                all_gather(&comm, Tag::Vote, &comm.rank(), None)
                    .await
                    .map(|all| (comm.rank(), all.len()))
            })
            .await
            .unwrap();
        let ranks: Vec<_> = ranks.into_iter().map(Result::unwrap).collect();
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[tokio::test]
    async fn test_input_count_must_match() {
        let err = LocalCluster::new(2)
            .sort(vec![vec![1i64]])
            .await
            .unwrap_err();
        assert!(matches!(err, SortError::Topology(_)));
    }

    #[tokio::test]
    async fn test_empty_cluster_is_a_topology_error() {
        let err = LocalCluster::new(0)
            .sort(Vec::<Vec<i64>>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SortError::Topology(_)));
    }

    #[tokio::test]
    async fn test_panicking_worker_unblocks_peers() {
        let cluster = LocalCluster::new(2);
        let err = cluster
            .run(|comm| async move {
                if comm.rank() == 1 {
                    panic!("worker crashed");
                }
                comm.recv(1, Tag::Vote).await.map(|_| ())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SortError::Worker(_)));
    }
}
