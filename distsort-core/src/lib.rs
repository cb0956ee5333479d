//! distsort-core
//!
//! This library sorts data that is spread across a group of message-passing
//! workers. Each worker holds one partition; after a sort the rank-order
//! concatenation of the partitions is ascending and holds the same elements.
//! The total count is conserved but a single worker's share may grow or
//! shrink. The group may have any number of workers and the partitions may
//! have any (non-zero) sizes.
//! It is meant for usage with the `tokio` runtime, either with all workers in
//! one process ([`cluster::LocalCluster`]) or one worker per process over TCP
//! (the `distsort-worker` binary).
//!
//! # Functionality
//!
//! - Bitonic sorting networks for power-of-two and arbitrary group sizes
//! - Pairwise exchange-and-merge with uneven partition sizes
//! - In-process and TCP communicators with group splitting
//! - Collective sortedness check
//! - Partition storage and generation
//! - Timing and logging
//!
//! # Features
//!
//! - `rayon` - Sort the local partition on the rayon thread pool

/// Bitonic networks and the recursive sort for arbitrary group sizes
pub mod bitonic;

/// In-process clusters of workers
pub mod cluster;

/// Payload encoding and compression
pub mod codec;

/// Communicators and collectives
pub mod comm;

/// Sort, transport and worker configuration
pub mod config;

/// Error types
pub mod error;

/// Exchange-and-merge between two workers
pub mod exchange;

/// Utility functions for splitting and combining partitions
pub mod partition;

/// Sort entry points and the collective sortedness check
pub mod sorter;

/// Partition storage
pub mod storage;

/// Timing and logging utilities
pub mod timing;

/// Power-of-two helpers
pub mod topology;

pub use bitonic::SortElement;
pub use cluster::LocalCluster;
pub use comm::Communicator;
pub use config::SortConfig;
pub use error::{CommError, SortError};
pub use sorter::{DistributedSorter, bitonic_sort, bitonic_sort_by, is_sorted, is_sorted_by};
