//! Input parsing and the streaming event source
//!
//! Records are one per line, either `timestamp, light_id, cars_passed`
//! (streaming input) or `timestamp light_id cars_passed` (distributed
//! input). Blank lines are ignored. A malformed line is either skipped with
//! a warning or aborts the run, depending on [`ParsePolicy`].

use crate::error::{Result, TrafficError};
use crate::event::{events, EventEmitter, PipelineEvent};
use crate::model::TrafficEvent;
use crate::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Textual shape of an input record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// `timestamp, light_id, cars_passed`
    CommaSpace,
    /// `timestamp light_id cars_passed`
    Whitespace,
    /// Comma form if the line contains a comma, whitespace form otherwise
    Auto,
}

/// Handling of malformed records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsePolicy {
    /// Log a warning and continue with the next record
    #[default]
    Skip,
    /// Fail the run on the first malformed record
    Abort,
}

/// Parse one input line.
///
/// `line_no` is 1-based and only used for error reporting. Returns
/// `Ok(None)` for blank lines.
pub fn parse_line(
    line: &str,
    format: RecordFormat,
    line_no: usize,
) -> Result<Option<TrafficEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let comma = match format {
        RecordFormat::CommaSpace => true,
        RecordFormat::Whitespace => false,
        RecordFormat::Auto => line.contains(','),
    };
    let fields: Vec<&str> = if comma {
        line.split(',').map(str::trim).collect()
    } else {
        line.split_whitespace().collect()
    };

    let parse_err = |reason: String| TrafficError::Parse {
        line: line_no,
        reason,
    };

    let &[timestamp, light_id, cars_passed] = fields.as_slice() else {
        return Err(parse_err(format!("expected 3 fields, found {}", fields.len())));
    };
    if timestamp.is_empty() {
        return Err(parse_err("empty timestamp".to_string()));
    }
    let light_id = light_id
        .parse()
        .map_err(|_| parse_err(format!("invalid light_id '{}'", light_id)))?;
    let cars_passed = cars_passed
        .parse()
        .map_err(|_| parse_err(format!("invalid cars_passed '{}'", cars_passed)))?;

    Ok(Some(TrafficEvent::new(timestamp, light_id, cars_passed)))
}

/// Parsed events plus the number of records skipped under [`ParsePolicy::Skip`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub events: Vec<TrafficEvent>,
    pub skipped: usize,
}

/// Apply the parse policy to one line's outcome
fn admit(
    outcome: Result<Option<TrafficEvent>>,
    policy: ParsePolicy,
    skipped: &mut usize,
) -> Result<Option<TrafficEvent>> {
    match outcome {
        Ok(event) => Ok(event),
        Err(err) if policy == ParsePolicy::Skip => {
            tracing::warn!(error = %err, "skipping malformed record");
            *skipped += 1;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Parse a whole input text
pub fn parse_lines(input: &str, format: RecordFormat, policy: ParsePolicy) -> Result<EventBatch> {
    let mut batch = EventBatch::default();
    for (idx, line) in input.lines().enumerate() {
        let outcome = parse_line(line, format, idx + 1);
        if let Some(event) = admit(outcome, policy, &mut batch.skipped)? {
            batch.events.push(event);
        }
    }
    Ok(batch)
}

/// Read and parse a whole input file (distributed mode reads the full batch first)
pub async fn read_events(
    path: &Path,
    format: RecordFormat,
    policy: ParsePolicy,
) -> Result<EventBatch> {
    let input = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TrafficError::InputUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
    let batch = parse_lines(&input, format, policy)?;
    tracing::info!(
        path = %path.display(),
        events = batch.events.len(),
        skipped = batch.skipped,
        "input read"
    );
    Ok(batch)
}

/// Outcome of one producer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// Events pushed into the queue
    pub ingested: u64,
    /// Malformed records skipped
    pub skipped: u64,
}

/// Producer that reads records from a file and pushes them into a [`BoundedQueue`]
pub struct EventSource {
    path: PathBuf,
    format: RecordFormat,
    policy: ParsePolicy,
    delay: Duration,
    emitter: Option<EventEmitter>,
}

impl EventSource {
    /// Create a new event source for `path`
    pub fn new(path: impl Into<PathBuf>, format: RecordFormat) -> Self {
        Self {
            path: path.into(),
            format,
            policy: ParsePolicy::default(),
            delay: Duration::ZERO,
            emitter: None,
        }
    }

    /// Set parse policy (builder pattern)
    pub fn with_policy(mut self, policy: ParsePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pause after each pushed record (builder pattern)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Publish an ingest notification per record (builder pattern)
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file line by line and push every event into `queue`.
    ///
    /// Blocks on `put` while the queue is full. Does not close the queue;
    /// the owner of the queue decides when the stream ends.
    pub async fn run(&self, queue: &BoundedQueue<TrafficEvent>) -> Result<IngestSummary> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|source| TrafficError::InputUnavailable {
                path: self.path.clone(),
                source,
            })?;
        let mut lines = BufReader::new(file).lines();

        let mut summary = IngestSummary::default();
        let mut skipped = 0usize;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await.map_err(|source| {
            TrafficError::InputUnavailable {
                path: self.path.clone(),
                source,
            }
        })? {
            line_no += 1;
            let outcome = parse_line(&line, self.format, line_no);
            let Some(event) = admit(outcome, self.policy, &mut skipped)? else {
                continue;
            };

            let light_id = event.light_id;
            let cars_passed = event.cars_passed;
            queue.put(event).await?;
            summary.ingested += 1;

            if let Some(emitter) = &self.emitter {
                emitter.emit(PipelineEvent::with_map(
                    events::STREAM_EVENT_INGESTED,
                    HashMap::from([
                        ("light_id".to_string(), serde_json::json!(light_id)),
                        ("cars_passed".to_string(), serde_json::json!(cars_passed)),
                    ]),
                ));
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        summary.skipped = skipped as u64;
        tracing::debug!(
            ingested = summary.ingested,
            skipped = summary.skipped,
            "event source exhausted"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_comma_space() {
        let event = parse_line("08:15, 3, 42", RecordFormat::CommaSpace, 1)
            .unwrap()
            .unwrap();
        assert_eq!(event, TrafficEvent::new("08:15", 3, 42));
    }

    #[test]
    fn test_parse_whitespace() {
        let event = parse_line("13:00  7\t5", RecordFormat::Whitespace, 1)
            .unwrap()
            .unwrap();
        assert_eq!(event, TrafficEvent::new("13:00", 7, 5));
    }

    #[test]
    fn test_parse_auto() {
        let comma = parse_line("01:00, 1, 2", RecordFormat::Auto, 1).unwrap().unwrap();
        let space = parse_line("01:00 1 2", RecordFormat::Auto, 1).unwrap().unwrap();
        assert_eq!(comma, space);
    }

    #[test]
    fn test_parse_blank_line() {
        assert_eq!(parse_line("   ", RecordFormat::Whitespace, 1).unwrap(), None);
    }

    #[test]
    fn test_parse_non_numeric_cars() {
        let err = parse_line("08:00 1 many", RecordFormat::Whitespace, 4).unwrap_err();
        match err {
            TrafficError::Parse { line, reason } => {
                assert_eq!(line, 4);
                assert!(reason.contains("cars_passed"));
            }
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_non_numeric_light() {
        let err = parse_line("08:00, L1, 3", RecordFormat::CommaSpace, 2).unwrap_err();
        assert!(matches!(err, TrafficError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_negative_cars_rejected() {
        assert!(parse_line("08:00 1 -3", RecordFormat::Whitespace, 1).is_err());
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert!(parse_line("08:00 1", RecordFormat::Whitespace, 1).is_err());
        assert!(parse_line("08:00, 1, 2, 3", RecordFormat::CommaSpace, 1).is_err());
    }

    #[test]
    fn test_parse_lines_skip_policy() {
        let input = "08:00 1 10\nbroken\n\n09:00 2 x\n09:30 2 4\n";
        let batch = parse_lines(input, RecordFormat::Whitespace, ParsePolicy::Skip).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_parse_lines_abort_policy() {
        let input = "08:00 1 10\nbroken\n09:30 2 4\n";
        let err = parse_lines(input, RecordFormat::Whitespace, ParsePolicy::Abort).unwrap_err();
        assert!(matches!(err, TrafficError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_read_events_missing_file() {
        let err = read_events(
            Path::new("/nonexistent/traffic_data.txt"),
            RecordFormat::Whitespace,
            ParsePolicy::Skip,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TrafficError::InputUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_event_source_pushes_all_events() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "08:00, 1, 10").unwrap();
        writeln!(file, "oops").unwrap();
        writeln!(file, "08:05, 2, 5").unwrap();
        file.flush().unwrap();

        let queue = BoundedQueue::new(4).unwrap();
        let source = EventSource::new(file.path(), RecordFormat::CommaSpace);
        let summary = source.run(&queue).await.unwrap();

        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(queue.get().await, Some(TrafficEvent::new("08:00", 1, 10)));
        assert_eq!(queue.get().await, Some(TrafficEvent::new("08:05", 2, 5)));
    }

    #[tokio::test]
    async fn test_event_source_abort_policy() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "08:00, 1, 10").unwrap();
        writeln!(file, "08:00, 1").unwrap();
        file.flush().unwrap();

        let queue = BoundedQueue::new(4).unwrap();
        let source =
            EventSource::new(file.path(), RecordFormat::CommaSpace).with_policy(ParsePolicy::Abort);
        let err = source.run(&queue).await.unwrap_err();
        assert!(matches!(err, TrafficError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_event_source_missing_file() {
        let queue = BoundedQueue::new(1).unwrap();
        let source = EventSource::new("/nonexistent/traffic_data.txt", RecordFormat::CommaSpace);
        let err = source.run(&queue).await.unwrap_err();
        assert!(matches!(err, TrafficError::InputUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_event_source_fails_on_closed_queue() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "08:00, 1, 10").unwrap();
        file.flush().unwrap();

        let queue = BoundedQueue::new(1).unwrap();
        queue.close().await;
        let source = EventSource::new(file.path(), RecordFormat::CommaSpace);
        let err = source.run(&queue).await.unwrap_err();
        assert!(matches!(err, TrafficError::QueueClosed));
    }
}
