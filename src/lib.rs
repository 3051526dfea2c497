//! # traffic-rank
//!
//! Congestion ranking for traffic light sensor readings.
//!
//! ## Streaming mode (always compiled)
//!
//! - [`EventSource`] reads `timestamp, light_id, cars_passed` records and
//!   pushes them into a [`BoundedQueue`] with backpressure
//! - [`StreamingAggregator`] drains the queue and keeps a stream-wide top-5
//!   ranking up to date after every event
//! - The producer closes the queue when it is done, so the consumer stops
//!   deterministically
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `distributed` | ✅ | `bytes`, `num_cpus` | Coordinator/worker mode, wire codec, local and TCP transports |
//!
//! In distributed mode the coordinator (rank 0) groups the whole input by
//! hour, sends each hour bucket to exactly one worker, and prints the
//! per-hour top-2 rankings the workers send back.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use traffic_rank::{render_ranking, StreamingConfig, StreamingPipeline};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> traffic_rank::Result<()> {
//!     let config = StreamingConfig::default();
//!     let top_n = config.top_n;
//!     let summary = StreamingPipeline::new(config)
//!         .run(Path::new("traffic_data.txt"), |_, ranking| {
//!             print!("{}", render_ranking(ranking, top_n));
//!         })
//!         .await?;
//!     println!("{} events aggregated", summary.aggregate.events);
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod aggregator;
pub mod config;
pub mod error;
pub mod event;
pub mod generate;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod queue;

// Feature-gated modules
#[cfg(feature = "distributed")]
pub mod collector;
#[cfg(feature = "distributed")]
pub mod coordinator;
#[cfg(feature = "distributed")]
pub mod dispatch;
#[cfg(feature = "distributed")]
pub mod partition;
#[cfg(feature = "distributed")]
pub mod retry;
#[cfg(feature = "distributed")]
pub mod transport;
#[cfg(feature = "distributed")]
pub mod wire;
#[cfg(feature = "distributed")]
pub mod worker;

// Core re-exports
pub use aggregator::{render_ranking, AggregateSummary, StreamingAggregator};
pub use config::{AppConfig, StreamingConfig};
pub use error::{Result, TrafficError};
pub use event::{events, EventEmitter, EventPayload, EventStream, PipelineEvent};
pub use generate::{format_record, SampleGenerator};
pub use ingest::{
    parse_line, parse_lines, read_events, EventBatch, EventSource, IngestSummary, ParsePolicy,
    RecordFormat,
};
pub use metrics::{
    metric_names, HistogramStats, LocalMetrics, MetricsBackend, MetricsSnapshot, PipelineMetrics,
};
pub use model::{rank_top_n, CongestionTable, Hour, LightId, RankedEntry, Ranking, TrafficEvent};
pub use pipeline::{StreamSummary, StreamingPipeline};
pub use queue::{BoundedQueue, QueueStats};

// Feature-gated re-exports
#[cfg(feature = "distributed")]
pub use collector::{ReportCollector, ReportLine, TrafficReport};
#[cfg(feature = "distributed")]
pub use config::{DistributedConfig, MIN_LINK_CAPACITY};
#[cfg(feature = "distributed")]
pub use coordinator::{Coordinator, LocalCluster, RunOutcome};
#[cfg(feature = "distributed")]
pub use dispatch::{BucketAssignment, DispatchSummary, HourBuckets, PartitionDispatcher};
#[cfg(feature = "distributed")]
pub use partition::{
    CustomPartitioner, HourModuloPartitioner, PartitionStrategy, Partitioner,
    RoundRobinPartitioner,
};
#[cfg(feature = "distributed")]
pub use retry::RetryPolicy;
#[cfg(feature = "distributed")]
pub use transport::{LocalTransport, Rank, TcpTransport, Transport, COORDINATOR};
#[cfg(feature = "distributed")]
pub use wire::{
    DispatchMessage, MessageKind, ReportMessage, WireMessage, DISPATCH_HEADER_LEN, MAX_FRAME_LEN,
};
#[cfg(feature = "distributed")]
pub use worker::{WorkerAggregator, WorkerSummary};
