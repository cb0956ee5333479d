use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one distributed sort.
///
/// # Example
///
/// ```rust
/// # use distsort_core::config::SortConfig;
///
/// let config = SortConfig::default().with_timeout_ms(30_000).with_compression(true);
/// assert_eq!(config.exchange_timeout().unwrap().as_secs(), 30);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Upper bound on any single receive, in milliseconds. `None` waits forever.
    pub exchange_timeout_ms: Option<u64>,
    /// Compress exchange payloads with zstd before they hit the transport
    pub compress: bool,
    /// Sort the local partition on the rayon pool (needs the `rayon` feature)
    pub parallel_local_sort: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            exchange_timeout_ms: None,
            compress: false,
            parallel_local_sort: true,
        }
    }
}

impl SortConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.exchange_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_ms.map(Duration::from_millis)
    }
}

/// Addresses and connection policy for the TCP mesh.
///
/// `peers[r]` is the listen address of world rank `r`; the mesh size is
/// `peers.len()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpConfig {
    pub peers: Vec<String>,
    /// Extra dial attempts after the first one fails
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Backoff before retry `k` is `retry_base_delay_ms * 2^k`
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_connect_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

impl TcpConfig {
    pub fn new(peers: Vec<String>) -> Self {
        TcpConfig {
            peers,
            connect_retries: default_connect_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1 << attempt.min(16)))
    }
}

/// Configuration for local filesystem partition storage.
///
/// # Example
///
/// ```rust
/// # use distsort_core::config::LocalConfig;
/// # use std::path::Path;
///
/// let config = LocalConfig::new(Path::new("/tmp/distsort"), "run1_");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory path for storing files
    pub root: String,
    /// Filename prefix for organizing files
    pub prefix: String,
}

impl LocalConfig {
    pub fn new(root: &Path, prefix: &str) -> Self {
        LocalConfig {
            root: root.to_string_lossy().into_owned(),
            prefix: prefix.to_string(),
        }
    }
}

/// Everything a standalone worker process needs to take part in a sort.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// World rank of this process
    pub rank: usize,
    pub tcp: TcpConfig,
    #[serde(default)]
    pub sort: SortConfig,
    pub storage: LocalConfig,
    /// Partition id to load before sorting
    pub input_id: String,
    /// Partition id the sorted result is written to
    pub output_id: String,
    /// Optional CSV file for per-exchange timings
    #[serde(default)]
    pub timings_csv: Option<String>,
}

impl WorkerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&text)?)
    }
}
