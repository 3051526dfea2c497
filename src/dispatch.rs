//! Coordinator side of the distributed mode: hour partitioning and dispatch
//!
//! The whole input is grouped into hour buckets before anything is sent.
//! Each non-empty bucket travels to the worker chosen by the [`Partitioner`],
//! in ascending hour order, as one or more consecutive DISPATCH chunks that
//! each fit in a frame. Every worker then receives exactly one SENTINEL.

use crate::error::{Result, TrafficError};
use crate::event::{events, EventEmitter, PipelineEvent};
use crate::metrics::PipelineMetrics;
use crate::model::{Hour, TrafficEvent};
use crate::partition::{HourModuloPartitioner, Partitioner};
use crate::transport::{Rank, Transport, COORDINATOR};
use crate::wire::{DispatchMessage, WireMessage, DISPATCH_HEADER_LEN, MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Events grouped by hour, plus the number of records without a valid hour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HourBuckets {
    buckets: BTreeMap<Hour, Vec<TrafficEvent>>,
    dropped: usize,
}

impl HourBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one event to its hour bucket; returns false when it was dropped
    pub fn insert(&mut self, event: TrafficEvent) -> bool {
        match event.hour() {
            Some(hour) => {
                self.buckets.entry(hour).or_default().push(event);
                true
            }
            None => {
                tracing::debug!(timestamp = %event.timestamp, "record without valid hour dropped");
                self.dropped += 1;
                false
            }
        }
    }

    /// Non-empty hours, ascending
    pub fn hours(&self) -> impl Iterator<Item = Hour> + '_ {
        self.buckets.keys().copied()
    }

    pub fn get(&self, hour: Hour) -> Option<&[TrafficEvent]> {
        self.buckets.get(&hour).map(Vec::as_slice)
    }

    /// Number of non-empty buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Records that made it into a bucket
    pub fn records(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Sum of `cars_passed` in one bucket, 0 for an empty hour
    pub fn total_cars(&self, hour: Hour) -> u64 {
        self.get(hour)
            .map(|records| records.iter().map(|r| u64::from(r.cars_passed)).sum())
            .unwrap_or(0)
    }
}

impl FromIterator<TrafficEvent> for HourBuckets {
    fn from_iter<I: IntoIterator<Item = TrafficEvent>>(iter: I) -> Self {
        let mut buckets = Self::new();
        for event in iter {
            buckets.insert(event);
        }
        buckets
    }
}

impl IntoIterator for HourBuckets {
    type Item = (Hour, Vec<TrafficEvent>);
    type IntoIter = std::collections::btree_map::IntoIter<Hour, Vec<TrafficEvent>>;

    fn into_iter(self) -> Self::IntoIter {
        self.buckets.into_iter()
    }
}

/// One bucket as it was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAssignment {
    pub hour: Hour,
    pub target: Rank,
    pub records: usize,
    pub cars: u64,
    /// DISPATCH messages the bucket was split into
    pub chunks: usize,
}

/// Outcome of a dispatch phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Buckets in the order they were sent
    pub assignments: Vec<BucketAssignment>,
    /// Records without a valid hour
    pub dropped: usize,
    /// Sentinels sent, one per worker
    pub sentinels: usize,
}

impl DispatchSummary {
    pub fn records(&self) -> usize {
        self.assignments.iter().map(|a| a.records).sum()
    }

    /// Hours sent to `worker`, in dispatch order
    pub fn hours_for(&self, worker: Rank) -> Vec<Hour> {
        self.assignments
            .iter()
            .filter(|a| a.target == worker)
            .map(|a| a.hour)
            .collect()
    }
}

/// Splits the input by hour and hands each bucket to one worker
pub struct PartitionDispatcher {
    total_processes: usize,
    partitioner: Arc<dyn Partitioner>,
    max_chunk_bytes: usize,
    emitter: Option<EventEmitter>,
    metrics: Option<PipelineMetrics>,
}

impl PartitionDispatcher {
    /// Dispatcher for a group of `total_processes` ranks, coordinator included
    pub fn new(total_processes: usize) -> Self {
        Self {
            total_processes,
            partitioner: Arc::new(HourModuloPartitioner),
            max_chunk_bytes: MAX_FRAME_LEN,
            emitter: None,
            metrics: None,
        }
    }

    /// Replace the hour-modulo assignment (builder pattern)
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Largest DISPATCH body, clamped to `DISPATCH_HEADER_LEN..=MAX_FRAME_LEN` (builder pattern)
    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes.clamp(DISPATCH_HEADER_LEN, MAX_FRAME_LEN);
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn total_processes(&self) -> usize {
        self.total_processes
    }

    pub fn worker_count(&self) -> usize {
        self.total_processes.saturating_sub(1)
    }

    /// Group events into hour buckets
    pub fn partition<I>(&self, events: I) -> HourBuckets
    where
        I: IntoIterator<Item = TrafficEvent>,
    {
        let buckets: HourBuckets = events.into_iter().collect();
        tracing::debug!(
            buckets = buckets.len(),
            records = buckets.records(),
            dropped = buckets.dropped(),
            "input partitioned by hour"
        );
        buckets
    }

    /// Assign every non-empty hour to a worker without sending anything
    pub fn plan(&self, buckets: &HourBuckets) -> Result<Vec<(Hour, Rank)>> {
        self.check_group_size()?;
        let workers = self.worker_count();
        buckets
            .hours()
            .enumerate()
            .map(|(position, hour)| {
                let target = self.partitioner.target(hour, position, workers);
                if target == COORDINATOR || target >= self.total_processes {
                    return Err(TrafficError::ConfigError(format!(
                        "partitioner assigned hour {} to rank {}, outside 1..{}",
                        hour, target, self.total_processes
                    )));
                }
                Ok((hour, target))
            })
            .collect()
    }

    /// Send every bucket to its worker, then one SENTINEL to each worker
    pub async fn dispatch(
        &self,
        transport: &dyn Transport,
        buckets: HourBuckets,
    ) -> Result<DispatchSummary> {
        self.check_group_size()?;
        self.check_transport(transport)?;

        let plan = self.plan(&buckets)?;
        let dropped = buckets.dropped();
        let mut pending = buckets.buckets;
        let mut summary = DispatchSummary {
            dropped,
            ..Default::default()
        };

        for (hour, target) in plan {
            let records = pending.remove(&hour).ok_or_else(|| {
                TrafficError::Other(format!("planned hour {} has no bucket", hour))
            })?;
            let records_len = records.len();
            let cars: u64 = records.iter().map(|r| u64::from(r.cars_passed)).sum();
            let chunks = DispatchMessage::split(hour, records, self.max_chunk_bytes);
            let assignment = BucketAssignment {
                hour,
                target,
                records: records_len,
                cars,
                chunks: chunks.len(),
            };

            for chunk in chunks {
                transport.send(target, &WireMessage::Dispatch(chunk)).await?;
            }
            tracing::info!(
                hour = %hour,
                target,
                records = assignment.records,
                cars = assignment.cars,
                chunks = assignment.chunks,
                "bucket dispatched"
            );
            self.emit(PipelineEvent::with_map(
                events::DISPATCH_BUCKET_SENT,
                HashMap::from([
                    ("hour".to_string(), serde_json::json!(hour.value())),
                    ("target".to_string(), serde_json::json!(target)),
                    ("records".to_string(), serde_json::json!(assignment.records)),
                ]),
            ));
            if let Some(metrics) = &self.metrics {
                metrics
                    .record_bucket_dispatched(target, assignment.records)
                    .await;
            }
            summary.assignments.push(assignment);
        }

        for worker in 1..self.total_processes {
            transport.send(worker, &WireMessage::Sentinel).await?;
            summary.sentinels += 1;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_dropped(dropped as u64).await;
        }
        self.emit(PipelineEvent::with_map(
            events::DISPATCH_COMPLETED,
            HashMap::from([
                ("buckets".to_string(), serde_json::json!(summary.assignments.len())),
                ("records".to_string(), serde_json::json!(summary.records())),
                ("dropped".to_string(), serde_json::json!(dropped)),
            ]),
        ));
        tracing::info!(
            buckets = summary.assignments.len(),
            records = summary.records(),
            dropped,
            sentinels = summary.sentinels,
            "dispatch complete"
        );
        Ok(summary)
    }

    fn check_group_size(&self) -> Result<()> {
        if self.total_processes < 2 {
            return Err(TrafficError::ConfigError(format!(
                "distributed mode needs at least 2 processes, got {}",
                self.total_processes
            )));
        }
        Ok(())
    }

    fn check_transport(&self, transport: &dyn Transport) -> Result<()> {
        if transport.rank() != COORDINATOR {
            return Err(TrafficError::ConfigError(format!(
                "dispatch must run on rank 0, not rank {}",
                transport.rank()
            )));
        }
        let expected: Vec<Rank> = (1..self.total_processes).collect();
        if transport.peers() != expected {
            return Err(TrafficError::ConfigError(format!(
                "transport links ranks {:?}, expected {:?}",
                transport.peers(),
                expected
            )));
        }
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }
}
