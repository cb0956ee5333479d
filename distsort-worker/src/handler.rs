use std::time::Instant;

use distsort_core::comm::tcp::TcpMesh;
use distsort_core::config::WorkerConfig;
use distsort_core::error::{CommError, SortError, StorageError};
use distsort_core::sorter::{DistributedSorter, is_sorted};
use distsort_core::storage::{LocalPartitionStore, PartitionStore};
use distsort_core::Communicator;
use log::{error, info};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
    #[error("sort failed: {0}")]
    Sort(#[from] SortError),
    #[error("sorted output failed verification")]
    NotSorted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary printed by the worker once its slice is written.
#[derive(Serialize, Debug)]
pub(crate) struct WorkerReport {
    rank: usize,
    size: usize,
    elements: usize,
    elapsed_ms: f64,
    output_id: String,
}

/// Joins the TCP mesh described by `config` and runs [`sort_partition`] on it.
pub(crate) async fn run_worker(config: WorkerConfig) -> Result<WorkerReport, WorkerError> {
    let start = Instant::now();
    let mesh = TcpMesh::connect(config.rank, &config.tcp).await?;
    let comm = mesh.world();
    info!(
        "[Worker] Rank {}/{} connected in {:.2}s",
        comm.rank(),
        comm.size(),
        start.elapsed().as_secs_f64()
    );
    sort_partition(&comm, &config).await
}

/// Loads this rank's partition, sorts it with the rest of the group, checks
/// the global order and writes the sorted slice back to storage.
pub(crate) async fn sort_partition<C: Communicator>(
    comm: &C,
    config: &WorkerConfig,
) -> Result<WorkerReport, WorkerError> {
    let start = Instant::now();
    let store = LocalPartitionStore::<i64>::new(&config.storage);

    let mut data = match store.read(&config.input_id).await {
        Ok(data) => data,
        Err(e) => {
            error!("[Worker] Failed to load {}: {}", config.input_id, e);
            comm.abort(&format!("rank {} could not load its partition", comm.rank()))
                .await;
            return Err(e.into());
        }
    };
    info!("[Worker] Loaded {} elements from {}", data.len(), config.input_id);

    let mut sorter = DistributedSorter::new(config.sort.clone());
    sorter.sort(comm, &mut data).await?;

    if !is_sorted(comm, &data, config.sort.exchange_timeout()).await? {
        return Err(WorkerError::NotSorted);
    }

    store.write(&config.output_id, &data).await?;
    if let Some(prefix) = &config.timings_csv {
        sorter.export_all_timings(prefix)?;
    }
    sorter.print_timing_summary();

    Ok(WorkerReport {
        rank: comm.rank(),
        size: comm.size(),
        elements: data.len(),
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        output_id: config.output_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use distsort_core::comm::local::LocalFabric;
    use distsort_core::config::{LocalConfig, SortConfig, TcpConfig};
    use std::path::Path;

    fn config(root: &Path, rank: usize) -> WorkerConfig {
        WorkerConfig {
            rank,
            tcp: TcpConfig::new(Vec::new()),
            sort: SortConfig::default().with_timeout_ms(10_000),
            storage: LocalConfig::new(root, "test-"),
            input_id: format!("input-{}", rank),
            output_id: format!("sorted-{}", rank),
            timings_csv: None,
        }
    }

    #[tokio::test]
    async fn test_workers_sort_stored_partitions() {
        let root = std::env::temp_dir().join(format!("distsort_worker_{}", std::process::id()));
        let inputs: Vec<Vec<i64>> = vec![vec![40, -3, 12], vec![7], vec![100, 0], vec![5, 5]];
        let store = LocalPartitionStore::<i64>::new(&LocalConfig::new(&root, "test-"));
        for (rank, input) in inputs.iter().enumerate() {
            store.write(&format!("input-{}", rank), input).await.unwrap();
        }

        let fabric = LocalFabric::new(inputs.len());
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .map(|comm| {
                let config = config(&root, comm.rank());
                tokio::spawn(async move { sort_partition(&comm, &config).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut sorted = Vec::new();
        for rank in 0..inputs.len() {
            sorted.push(store.read(&format!("sorted-{}", rank)).await.unwrap());
        }
        assert!(sorted.iter().all(|p| !p.is_empty()));
        assert_eq!(sorted.concat(), vec![-3, 0, 5, 5, 7, 12, 40, 100]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_missing_partition_aborts_peers() {
        let root = std::env::temp_dir().join(format!("distsort_worker_missing_{}", std::process::id()));
        let store = LocalPartitionStore::<i64>::new(&LocalConfig::new(&root, "test-"));
        store.write("input-0", &[1, 2]).await.unwrap();

        let fabric = LocalFabric::new(2);
        let handles: Vec<_> = fabric
            .world()
            .into_iter()
            .map(|comm| {
                let config = config(&root, comm.rank());
                tokio::spawn(async move { sort_partition(&comm, &config).await })
            })
            .collect();
        let mut errors = Vec::new();
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }
        assert!(matches!(errors[0], WorkerError::Sort(ref e) if e.is_remote_abort()));
        assert!(matches!(errors[1], WorkerError::Storage(StorageError::NotFound(_))));
        let _ = std::fs::remove_dir_all(root);
    }
}
