//! Run configuration for the streaming and distributed modes

use crate::error::{Result, TrafficError};
use crate::ingest::{ParsePolicy, RecordFormat};
#[cfg(feature = "distributed")]
use crate::model::Hour;
#[cfg(feature = "distributed")]
use crate::partition::PartitionStrategy;
#[cfg(feature = "distributed")]
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Streaming mode configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// Capacity of the queue between producer and consumer
    pub queue_capacity: usize,
    /// Entries in each ranking
    pub top_n: usize,
    /// Pause between records read by the producer
    #[serde(default, with = "duration_serde")]
    pub ingest_delay: Duration,
    /// Expected record shape
    #[serde(default = "default_streaming_format")]
    pub format: RecordFormat,
    /// What to do with malformed records
    #[serde(default)]
    pub parse_policy: ParsePolicy,
}

fn default_streaming_format() -> RecordFormat {
    RecordFormat::CommaSpace
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            top_n: 5,
            ingest_delay: Duration::ZERO,
            format: default_streaming_format(),
            parse_policy: ParsePolicy::default(),
        }
    }
}

impl StreamingConfig {
    /// Create a new streaming configuration
    pub fn new(queue_capacity: usize, top_n: usize) -> Self {
        Self {
            queue_capacity,
            top_n,
            ..Self::default()
        }
    }

    /// Set producer delay (builder pattern)
    pub fn with_ingest_delay(mut self, delay: Duration) -> Self {
        self.ingest_delay = delay;
        self
    }

    /// Set record format (builder pattern)
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    /// Set parse policy (builder pattern)
    pub fn with_parse_policy(mut self, parse_policy: ParsePolicy) -> Self {
        self.parse_policy = parse_policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(TrafficError::ConfigError(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Distributed mode configuration
#[cfg(feature = "distributed")]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedConfig {
    /// Size of the process group, coordinator included
    pub total_processes: usize,
    /// Entries in each per-hour ranking
    pub top_n: usize,
    /// Expected record shape
    #[serde(default = "default_distributed_format")]
    pub format: RecordFormat,
    /// What to do with malformed records
    #[serde(default)]
    pub parse_policy: ParsePolicy,
    /// Hour to worker assignment
    #[serde(default)]
    pub partition: PartitionStrategy,
    /// Frames buffered per direction on an in-process link
    #[serde(default = "default_link_capacity")]
    pub link_capacity: usize,
    /// Backoff used by TCP workers while the coordinator is not listening yet
    #[serde(default)]
    pub connect_retry: RetryPolicy,
}

/// Smallest in-process link that holds every frame a worker can send
/// (one report per hour plus REPORT_END) while the coordinator is still
/// dispatching.
#[cfg(feature = "distributed")]
pub const MIN_LINK_CAPACITY: usize = Hour::COUNT as usize + 1;

#[cfg(feature = "distributed")]
fn default_distributed_format() -> RecordFormat {
    RecordFormat::Whitespace
}

#[cfg(feature = "distributed")]
fn default_link_capacity() -> usize {
    64
}

#[cfg(feature = "distributed")]
impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            total_processes: 3,
            top_n: 2,
            format: default_distributed_format(),
            parse_policy: ParsePolicy::default(),
            partition: PartitionStrategy::default(),
            link_capacity: default_link_capacity(),
            connect_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(feature = "distributed")]
impl DistributedConfig {
    /// Create a new distributed configuration
    pub fn new(total_processes: usize, top_n: usize) -> Self {
        Self {
            total_processes,
            top_n,
            ..Self::default()
        }
    }

    /// One worker per CPU core plus the coordinator
    pub fn auto() -> Self {
        Self::new(num_cpus::get().max(1) + 1, 2)
    }

    /// Set record format (builder pattern)
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    /// Set parse policy (builder pattern)
    pub fn with_parse_policy(mut self, parse_policy: ParsePolicy) -> Self {
        self.parse_policy = parse_policy;
        self
    }

    /// Set partition strategy (builder pattern)
    pub fn with_partition(mut self, partition: PartitionStrategy) -> Self {
        self.partition = partition;
        self
    }

    /// Set in-process link capacity (builder pattern)
    pub fn with_link_capacity(mut self, link_capacity: usize) -> Self {
        self.link_capacity = link_capacity;
        self
    }

    /// Set worker connect retry policy (builder pattern)
    pub fn with_connect_retry(mut self, connect_retry: RetryPolicy) -> Self {
        self.connect_retry = connect_retry;
        self
    }

    /// Number of worker ranks
    pub fn worker_count(&self) -> usize {
        self.total_processes.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_processes < 2 {
            return Err(TrafficError::ConfigError(format!(
                "distributed mode needs at least 2 processes, got {}",
                self.total_processes
            )));
        }
        if self.link_capacity < MIN_LINK_CAPACITY {
            return Err(TrafficError::ConfigError(format!(
                "link_capacity must be at least {}, got {}",
                MIN_LINK_CAPACITY, self.link_capacity
            )));
        }
        Ok(())
    }
}

/// Configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[cfg(feature = "distributed")]
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl AppConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            TrafficError::InputUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            TrafficError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        config.streaming.validate()?;
        #[cfg(feature = "distributed")]
        config.distributed.validate()?;
        Ok(config)
    }
}
