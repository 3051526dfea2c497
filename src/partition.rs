//! Hour-bucket to worker assignment
//!
//! Each non-empty hour bucket is owned by exactly one worker for the whole
//! run. The default policy pins hour `h` to worker `(h mod workers) + 1`;
//! rank 0 is the coordinator and never receives buckets.

use crate::model::Hour;
use crate::transport::Rank;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Partitioner trait for distributing hour buckets across workers
///
/// Implementations return the same rank for the same arguments.
pub trait Partitioner: Send + Sync {
    /// Worker rank for `hour`, in the range `1..=worker_count`.
    ///
    /// `position` is the bucket's index among the non-empty hours in
    /// ascending order. Callers guarantee `worker_count >= 1`.
    fn target(&self, hour: Hour, position: usize, worker_count: usize) -> Rank;
}

/// `(hour mod worker_count) + 1`
#[derive(Debug, Clone, Copy, Default)]
pub struct HourModuloPartitioner;

impl Partitioner for HourModuloPartitioner {
    fn target(&self, hour: Hour, _position: usize, worker_count: usize) -> Rank {
        usize::from(hour.value()) % worker_count + 1
    }
}

/// Hands buckets to workers in turn, in ascending hour order
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinPartitioner;

impl RoundRobinPartitioner {
    pub fn new() -> Self {
        Self
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn target(&self, _hour: Hour, position: usize, worker_count: usize) -> Rank {
        position % worker_count + 1
    }
}

/// Partitioner backed by a user-provided `(hour, worker_count)` function
pub struct CustomPartitioner<F>
where
    F: Fn(Hour, usize) -> Rank + Send + Sync,
{
    func: F,
}

impl<F> CustomPartitioner<F>
where
    F: Fn(Hour, usize) -> Rank + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Partitioner for CustomPartitioner<F>
where
    F: Fn(Hour, usize) -> Rank + Send + Sync,
{
    fn target(&self, hour: Hour, _position: usize, worker_count: usize) -> Rank {
        (self.func)(hour, worker_count)
    }
}

/// Partitioning strategy selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Hour-pinned assignment, `(hour mod workers) + 1`
    #[default]
    HourModulo,
    /// Rotate through workers in dispatch order
    RoundRobin,
}

impl PartitionStrategy {
    /// Create a partitioner instance based on the strategy
    pub fn create_partitioner(&self) -> Arc<dyn Partitioner> {
        match self {
            PartitionStrategy::HourModulo => Arc::new(HourModuloPartitioner),
            PartitionStrategy::RoundRobin => Arc::new(RoundRobinPartitioner),
        }
    }
}
