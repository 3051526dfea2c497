//! Streaming mode: EventSource → BoundedQueue → StreamingAggregator
//!
//! The producer runs on its own tokio task and the consumer on the caller's
//! task. When the producer finishes, successfully or not, the pipeline
//! closes the queue so the consumer drains the remaining events and stops.

use crate::aggregator::{AggregateSummary, StreamingAggregator};
use crate::config::StreamingConfig;
use crate::error::{Result, TrafficError};
use crate::event::{events, EventEmitter, PipelineEvent};
use crate::ingest::{EventSource, IngestSummary};
use crate::metrics::PipelineMetrics;
use crate::model::{Ranking, TrafficEvent};
use crate::queue::{BoundedQueue, QueueStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Outcome of a streaming run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub ingest: IngestSummary,
    pub aggregate: AggregateSummary,
    pub queue: QueueStats,
}

/// Single-process producer/consumer pipeline
pub struct StreamingPipeline {
    config: StreamingConfig,
    emitter: EventEmitter,
    metrics: Option<PipelineMetrics>,
}

impl StreamingPipeline {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            emitter: EventEmitter::default(),
            metrics: None,
        }
    }

    /// Publish lifecycle events through `emitter` (builder pattern)
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Record run metrics (builder pattern)
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Stream `input` through the queue, calling `on_update` after every event
    pub async fn run<F>(&self, input: &Path, mut on_update: F) -> Result<StreamSummary>
    where
        F: FnMut(&TrafficEvent, &Ranking),
    {
        self.config.validate()?;
        let queue = BoundedQueue::new(self.config.queue_capacity)?;

        let source = EventSource::new(input, self.config.format)
            .with_policy(self.config.parse_policy)
            .with_delay(self.config.ingest_delay)
            .with_emitter(self.emitter.clone());

        tracing::info!(
            input = %input.display(),
            capacity = self.config.queue_capacity,
            top_n = self.config.top_n,
            "starting streaming pipeline"
        );

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let result = source.run(&queue).await;
                queue.close().await;
                result
            })
        };

        let mut aggregator = StreamingAggregator::new(self.config.top_n);
        let emitter = self.emitter.clone();
        let aggregate = aggregator
            .run(&queue, |event, ranking| {
                emitter.emit(PipelineEvent::with_map(
                    events::STREAM_RANKING_UPDATED,
                    HashMap::from([
                        ("light_id".to_string(), serde_json::json!(event.light_id)),
                        ("ranking".to_string(), serde_json::json!(ranking)),
                    ]),
                ));
                on_update(event, ranking);
            })
            .await;

        let ingest = producer
            .await
            .map_err(|e| TrafficError::Other(format!("producer task failed: {}", e)))??;
        let queue_stats = queue.stats().await;

        if let Some(metrics) = &self.metrics {
            metrics.record_ingested(ingest.ingested).await;
            metrics.record_skipped(ingest.skipped).await;
            metrics.record_aggregated(aggregate.events).await;
            metrics.set_queue_peak_depth(queue_stats.peak_len).await;
        }

        self.emitter.emit(PipelineEvent::with_map(
            events::STREAM_COMPLETED,
            HashMap::from([
                ("ingested".to_string(), serde_json::json!(ingest.ingested)),
                ("skipped".to_string(), serde_json::json!(ingest.skipped)),
                ("aggregated".to_string(), serde_json::json!(aggregate.events)),
            ]),
        ));
        tracing::info!(
            ingested = ingest.ingested,
            skipped = ingest.skipped,
            aggregated = aggregate.events,
            peak_queue_len = queue_stats.peak_len,
            "streaming pipeline finished"
        );

        Ok(StreamSummary {
            ingest,
            aggregate,
            queue: queue_stats,
        })
    }
}
