//! Coordinator side of the distributed mode: report collection

use crate::error::{Result, TrafficError};
use crate::event::{events, EventEmitter, PipelineEvent};
use crate::metrics::PipelineMetrics;
use crate::model::{Hour, LightId};
use crate::transport::{Rank, Transport, COORDINATOR};
use crate::wire::WireMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Write};

const RULE_WIDTH: usize = 44;

/// One ranked light for one hour, as reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    pub worker: Rank,
    pub hour: Hour,
    pub light_id: LightId,
    pub count: u64,
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "At {} - Traffic Light {} handled {} cars.",
            self.hour, self.light_id, self.count
        )
    }
}

/// Collected per-hour rankings.
///
/// Lines are ordered by worker rank, then by the order the worker reported
/// them; hours are not globally sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    lines: Vec<ReportLine>,
}

impl TrafficReport {
    pub fn new(lines: Vec<ReportLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<ReportLine> {
        self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines reported by one worker
    pub fn for_worker(&self, worker: Rank) -> impl Iterator<Item = &ReportLine> + '_ {
        self.lines.iter().filter(move |line| line.worker == worker)
    }

    /// Lines for one hour
    pub fn for_hour(&self, hour: Hour) -> impl Iterator<Item = &ReportLine> + '_ {
        self.lines.iter().filter(move |line| line.hour == hour)
    }

    /// Render the report as printed by the coordinator
    pub fn render(&self, top_n: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out);
        let _ = writeln!(out, "=== Traffic Analysis Report ===");
        let _ = writeln!(out, "Top {} busiest traffic lights for each hour:", top_n);
        let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
        for line in &self.lines {
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

/// Receives every worker's reports after dispatch has finished
pub struct ReportCollector {
    total_processes: usize,
    emitter: Option<EventEmitter>,
    metrics: Option<PipelineMetrics>,
}

impl ReportCollector {
    pub fn new(total_processes: usize) -> Self {
        Self {
            total_processes,
            emitter: None,
            metrics: None,
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Drain workers `1..total_processes` in ascending order, each until REPORT_END
    pub async fn collect(&self, transport: &dyn Transport) -> Result<TrafficReport> {
        if transport.rank() != COORDINATOR {
            return Err(TrafficError::ConfigError(format!(
                "collection must run on rank 0, not rank {}",
                transport.rank()
            )));
        }

        let mut lines = Vec::new();
        for worker in 1..self.total_processes {
            let mut reports = 0usize;
            loop {
                match transport.recv(worker).await? {
                    WireMessage::ReportEnd => break,
                    WireMessage::Report(report) => {
                        reports += 1;
                        lines.extend(report.entries.iter().map(|entry| ReportLine {
                            worker,
                            hour: report.hour,
                            light_id: entry.light_id,
                            count: entry.count,
                        }));
                        if let Some(metrics) = &self.metrics {
                            metrics.record_report(worker).await;
                        }
                        if let Some(emitter) = &self.emitter {
                            emitter.emit(PipelineEvent::with_map(
                                events::COLLECT_REPORT_RECEIVED,
                                HashMap::from([
                                    ("worker".to_string(), serde_json::json!(worker)),
                                    ("hour".to_string(), serde_json::json!(report.hour.value())),
                                    ("entries".to_string(), serde_json::json!(report.entries.len())),
                                ]),
                            ));
                        }
                    }
                    other => {
                        return Err(TrafficError::Protocol(format!(
                            "expected REPORT or REPORT_END from worker {}, got {}",
                            worker,
                            other.kind()
                        )))
                    }
                }
            }
            tracing::debug!(worker, reports, "worker drained");
        }

        if let Some(emitter) = &self.emitter {
            emitter.emit(PipelineEvent::with_map(
                events::COLLECT_COMPLETED,
                HashMap::from([("lines".to_string(), serde_json::json!(lines.len()))]),
            ));
        }
        tracing::info!(lines = lines.len(), "reports collected");
        Ok(TrafficReport::new(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RankedEntry;
    use crate::transport::LocalTransport;
    use crate::wire::ReportMessage;

    fn hour(value: u8) -> Hour {
        Hour::new(value).unwrap()
    }

    fn report(h: u8, entries: &[(LightId, u64)]) -> WireMessage {
        WireMessage::Report(ReportMessage::new(
            hour(h),
            entries
                .iter()
                .map(|(light, count)| RankedEntry::new(*light, *count))
                .collect(),
        ))
    }

    #[test]
    fn test_report_line_display() {
        let line = ReportLine {
            worker: 1,
            hour: hour(8),
            light_id: 1,
            count: 10,
        };
        assert_eq!(line.to_string(), "At 08:00 - Traffic Light 1 handled 10 cars.");
    }

    #[test]
    fn test_render() {
        let report = TrafficReport::new(vec![ReportLine {
            worker: 2,
            hour: hour(9),
            light_id: 1,
            count: 3,
        }]);
        let rendered = report.render(2);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "=== Traffic Analysis Report ===");
        assert_eq!(lines[2], "Top 2 busiest traffic lights for each hour:");
        assert_eq!(lines[3], "-".repeat(44));
        assert_eq!(lines[4], "At 09:00 - Traffic Light 1 handled 3 cars.");
        assert_eq!(lines.len(), 5);
    }

    #[tokio::test]
    async fn test_collect_in_worker_order() {
        let group = LocalTransport::group(3, 64).unwrap();
        // worker 2 reports first, but worker 1 is drained first
        group[2].send(0, &report(9, &[(1, 3)])).await.unwrap();
        group[2].send(0, &WireMessage::ReportEnd).await.unwrap();
        group[1].send(0, &report(8, &[(1, 10), (2, 5)])).await.unwrap();
        group[1].send(0, &report(2, &[(7, 1)])).await.unwrap();
        group[1].send(0, &WireMessage::ReportEnd).await.unwrap();

        let collected = ReportCollector::new(3).collect(&group[0]).await.unwrap();
        let summary: Vec<(Rank, u8, LightId, u64)> = collected
            .lines()
            .iter()
            .map(|l| (l.worker, l.hour.value(), l.light_id, l.count))
            .collect();
        assert_eq!(
            summary,
            vec![(1, 8, 1, 10), (1, 8, 2, 5), (1, 2, 7, 1), (2, 9, 1, 3)]
        );
        assert_eq!(collected.for_worker(2).count(), 1);
        assert_eq!(collected.for_hour(hour(8)).count(), 2);
    }

    #[tokio::test]
    async fn test_collect_rejects_unexpected_message() {
        let group = LocalTransport::group(2, 64).unwrap();
        group[1].send(0, &WireMessage::Sentinel).await.unwrap();
        let err = ReportCollector::new(2).collect(&group[0]).await.unwrap_err();
        assert!(matches!(err, TrafficError::Protocol(ref m) if m.contains("SENTINEL")));
    }

    #[tokio::test]
    async fn test_collect_records_metrics_and_events() {
        let group = LocalTransport::group(2, 64).unwrap();
        group[1].send(0, &report(8, &[(1, 10)])).await.unwrap();
        group[1].send(0, &WireMessage::ReportEnd).await.unwrap();

        let metrics = PipelineMetrics::local();
        let emitter = EventEmitter::new(16);
        let mut done = emitter.subscribe_filtered(|e| e.key == events::COLLECT_COMPLETED);
        let collected = ReportCollector::new(2)
            .with_metrics(metrics.clone())
            .with_emitter(emitter)
            .collect(&group[0])
            .await
            .unwrap();
        assert_eq!(collected.len(), 1);

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.counters["traffic.reports.received"], 1);
        let event = done.recv().await.unwrap();
        assert_eq!(event.field("lines"), Some(&serde_json::json!(1)));
    }
}
