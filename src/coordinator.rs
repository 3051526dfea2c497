//! Distributed run orchestration
//!
//! [`Coordinator`] drives rank 0 over any [`Transport`]: dispatch every
//! bucket and sentinel first, then collect every worker's reports.
//! [`LocalCluster`] runs the coordinator and all workers as tokio tasks in
//! one process over a [`LocalTransport`] group.

use crate::collector::{ReportCollector, TrafficReport};
use crate::config::DistributedConfig;
use crate::dispatch::{DispatchSummary, PartitionDispatcher};
use crate::error::{Result, TrafficError};
use crate::event::EventEmitter;
use crate::ingest::read_events;
use crate::metrics::PipelineMetrics;
use crate::model::TrafficEvent;
use crate::transport::{LocalTransport, Transport};
use crate::worker::{WorkerAggregator, WorkerSummary};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Outcome of a distributed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    /// Malformed input lines skipped before partitioning
    pub skipped: usize,
    pub dispatch: DispatchSummary,
    pub report: TrafficReport,
    /// Worker summaries, ascending rank; empty when workers run elsewhere
    pub workers: Vec<WorkerSummary>,
}

/// Rank 0 of a distributed run
pub struct Coordinator {
    config: DistributedConfig,
    emitter: EventEmitter,
    metrics: Option<PipelineMetrics>,
}

impl Coordinator {
    pub fn new(config: DistributedConfig) -> Self {
        Self {
            config,
            emitter: EventEmitter::default(),
            metrics: None,
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// Read `input` in full, then run the distributed phases
    pub async fn run_file(&self, transport: &dyn Transport, input: &Path) -> Result<RunOutcome> {
        self.config.validate()?;
        let batch = read_events(input, self.config.format, self.config.parse_policy).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_skipped(batch.skipped as u64).await;
        }
        let mut outcome = self.run(transport, batch.events).await?;
        outcome.skipped = batch.skipped;
        Ok(outcome)
    }

    /// Dispatch `events` to the workers, then collect their reports
    pub async fn run(
        &self,
        transport: &dyn Transport,
        events: Vec<TrafficEvent>,
    ) -> Result<RunOutcome> {
        self.config.validate()?;
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            run_id = %run_id,
            total_processes = self.config.total_processes,
            events = events.len(),
            partition = ?self.config.partition,
            "distributed run started"
        );

        let mut dispatcher = PartitionDispatcher::new(self.config.total_processes)
            .with_partitioner(self.config.partition.create_partitioner())
            .with_emitter(self.emitter.clone());
        let mut collector =
            ReportCollector::new(self.config.total_processes).with_emitter(self.emitter.clone());
        if let Some(metrics) = &self.metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
            collector = collector.with_metrics(metrics.clone());
        }

        let buckets = dispatcher.partition(events);
        let dispatch = dispatcher.dispatch(transport, buckets).await?;
        let report = collector.collect(transport).await?;

        tracing::info!(
            run_id = %run_id,
            buckets = dispatch.assignments.len(),
            lines = report.len(),
            "distributed run finished"
        );
        Ok(RunOutcome {
            run_id,
            skipped: 0,
            dispatch,
            report,
            workers: Vec::new(),
        })
    }
}

/// Coordinator and workers as tasks of one process
pub struct LocalCluster {
    config: DistributedConfig,
    emitter: EventEmitter,
    metrics: Option<PipelineMetrics>,
}

impl LocalCluster {
    pub fn new(config: DistributedConfig) -> Self {
        Self {
            config,
            emitter: EventEmitter::default(),
            metrics: None,
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run over an input file
    pub async fn run_file(&self, input: &Path) -> Result<RunOutcome> {
        self.execute(|coordinator, transport| async move {
            coordinator.run_file(&transport, input).await
        })
        .await
    }

    /// Run over already parsed events
    pub async fn run(&self, events: Vec<TrafficEvent>) -> Result<RunOutcome> {
        self.execute(|coordinator, transport| async move {
            coordinator.run(&transport, events).await
        })
        .await
    }

    async fn execute<F, Fut>(&self, drive: F) -> Result<RunOutcome>
    where
        F: FnOnce(Coordinator, LocalTransport) -> Fut,
        Fut: std::future::Future<Output = Result<RunOutcome>>,
    {
        self.config.validate()?;
        let mut endpoints =
            LocalTransport::group(self.config.total_processes, self.config.link_capacity)?
                .into_iter();
        let coordinator_endpoint = endpoints
            .next()
            .ok_or_else(|| TrafficError::Other("process group has no coordinator".to_string()))?;

        let aggregator = WorkerAggregator::new(self.config.top_n);
        let handles: Vec<_> = endpoints
            .map(move |endpoint| tokio::spawn(async move { aggregator.run(&endpoint).await }))
            .collect();

        let mut coordinator = Coordinator::new(self.config.clone()).with_emitter(self.emitter.clone());
        if let Some(metrics) = &self.metrics {
            coordinator = coordinator.with_metrics(metrics.clone());
        }
        // the coordinator endpoint is dropped when `drive` returns, which
        // releases any worker still waiting after a failed run
        let result = drive(coordinator, coordinator_endpoint).await;

        let mut workers = Vec::with_capacity(handles.len());
        let mut worker_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(summary)) => workers.push(summary),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "worker failed");
                    worker_error.get_or_insert(e);
                }
                Err(e) => {
                    worker_error
                        .get_or_insert(TrafficError::Other(format!("worker task failed: {}", e)));
                }
            }
        }

        let mut outcome = result?;
        if let Some(e) = worker_error {
            return Err(e);
        }
        outcome.workers = workers;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::events;
    use crate::model::Hour;
    use crate::partition::PartitionStrategy;

    fn scenario() -> Vec<TrafficEvent> {
        vec![
            TrafficEvent::new("08", 1, 10),
            TrafficEvent::new("08", 2, 5),
            TrafficEvent::new("09", 1, 3),
        ]
    }

    #[tokio::test]
    async fn test_local_cluster_scenario() {
        let outcome = LocalCluster::new(DistributedConfig::new(3, 2))
            .run(scenario())
            .await
            .unwrap();

        let lines: Vec<String> = outcome
            .report
            .lines()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "At 08:00 - Traffic Light 1 handled 10 cars.",
                "At 08:00 - Traffic Light 2 handled 5 cars.",
                "At 09:00 - Traffic Light 1 handled 3 cars.",
            ]
        );
        assert_eq!(outcome.report.lines()[0].worker, 1);
        assert_eq!(outcome.report.lines()[2].worker, 2);
        assert_eq!(outcome.workers.len(), 2);
        assert_eq!(outcome.workers[0].hours, vec![Hour::new(8).unwrap()]);
        assert_eq!(outcome.dispatch.sentinels, 2);
        assert!(!outcome.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_local_cluster_round_robin() {
        let config = DistributedConfig::new(3, 2).with_partition(PartitionStrategy::RoundRobin);
        let events = vec![
            TrafficEvent::new("01:00", 1, 1),
            TrafficEvent::new("02:00", 1, 1),
            TrafficEvent::new("03:00", 1, 1),
        ];
        let outcome = LocalCluster::new(config).run(events).await.unwrap();
        assert_eq!(outcome.dispatch.hours_for(1).len(), 2);
        assert_eq!(outcome.dispatch.hours_for(2).len(), 1);
        assert_eq!(outcome.report.len(), 3);
    }

    #[tokio::test]
    async fn test_local_cluster_rejects_single_process() {
        let result = LocalCluster::new(DistributedConfig::new(1, 2)).run(scenario()).await;
        assert!(matches!(result, Err(TrafficError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_local_cluster_empty_input() {
        let outcome = LocalCluster::new(DistributedConfig::new(4, 2))
            .run(Vec::new())
            .await
            .unwrap();
        assert!(outcome.report.is_empty());
        assert_eq!(outcome.workers.len(), 3);
        assert!(outcome.workers.iter().all(|w| w.buckets() == 0));
    }

    #[tokio::test]
    async fn test_local_cluster_missing_input_releases_workers() {
        let result = LocalCluster::new(DistributedConfig::default())
            .run_file(Path::new("/nonexistent/traffic_data.txt"))
            .await;
        assert!(matches!(result, Err(TrafficError::InputUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_coordinator_emits_lifecycle_events() {
        let group = LocalTransport::group(2, 64).unwrap();
        let emitter = EventEmitter::new(64);
        let mut stream = emitter.subscribe_filtered(|e| {
            e.key == events::DISPATCH_COMPLETED || e.key == events::COLLECT_COMPLETED
        });

        let mut endpoints = group.into_iter();
        let coordinator_endpoint = endpoints.next().unwrap();
        let worker_endpoint = endpoints.next().unwrap();
        let worker = tokio::spawn(async move {
            WorkerAggregator::new(2).run(&worker_endpoint).await
        });

        let outcome = Coordinator::new(DistributedConfig::new(2, 2))
            .with_emitter(emitter)
            .run(&coordinator_endpoint, scenario())
            .await
            .unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(outcome.report.len(), 3);
        assert_eq!(stream.recv().await.unwrap().key, events::DISPATCH_COMPLETED);
        assert_eq!(stream.recv().await.unwrap().key, events::COLLECT_COMPLETED);
    }
}
