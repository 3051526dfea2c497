//! Worker side of the distributed mode
//!
//! A worker owns the hours the coordinator sends it. Each bucket is ranked
//! on its own, with no state carried between hours, and answered with one
//! REPORT once its last DISPATCH chunk has arrived. The worker stops on
//! SENTINEL and closes its side with REPORT_END.

use crate::error::{Result, TrafficError};
use crate::model::{CongestionTable, Hour};
use crate::transport::{Rank, Transport, COORDINATOR};
use crate::wire::{DispatchMessage, ReportMessage, WireMessage};
use serde::{Deserialize, Serialize};

/// What one worker did during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub rank: Rank,
    /// Hours handled, in arrival order
    pub hours: Vec<Hour>,
    pub records: usize,
    pub cars: u64,
}

impl WorkerSummary {
    pub fn buckets(&self) -> usize {
        self.hours.len()
    }
}

/// Per-hour top-N ranking on a worker rank
#[derive(Debug, Clone, Copy)]
pub struct WorkerAggregator {
    top_n: usize,
}

impl WorkerAggregator {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Rank one hour bucket delivered as a single message
    pub fn aggregate_bucket(&self, bucket: &DispatchMessage) -> ReportMessage {
        let table: CongestionTable = bucket.records.iter().collect();
        self.report(bucket.hour, &table)
    }

    fn report(&self, hour: Hour, table: &CongestionTable) -> ReportMessage {
        ReportMessage::new(hour, table.top_n(self.top_n).into_entries())
    }

    /// Serve buckets from the coordinator until SENTINEL
    pub async fn run(&self, transport: &dyn Transport) -> Result<WorkerSummary> {
        let rank = transport.rank();
        if rank == COORDINATOR {
            return Err(TrafficError::ConfigError(
                "rank 0 is the coordinator and cannot run a worker".to_string(),
            ));
        }

        let mut summary = WorkerSummary {
            rank,
            ..Default::default()
        };

        // bucket whose last chunk has not arrived yet
        let mut open: Option<(Hour, CongestionTable)> = None;

        loop {
            match transport.recv(COORDINATOR).await? {
                WireMessage::Sentinel => {
                    if let Some((hour, _)) = open {
                        return Err(TrafficError::Protocol(format!(
                            "worker {} got SENTINEL before the last chunk of hour {}",
                            rank, hour
                        )));
                    }
                    break;
                }
                WireMessage::Dispatch(chunk) => {
                    let mut table = match open.take() {
                        Some((hour, table)) if hour == chunk.hour => table,
                        Some((hour, _)) => {
                            return Err(TrafficError::Protocol(format!(
                                "worker {} got hour {} before the last chunk of hour {}",
                                rank, chunk.hour, hour
                            )))
                        }
                        None => CongestionTable::new(),
                    };
                    table.extend(&chunk.records);
                    summary.records += chunk.records.len();
                    summary.cars += chunk.total_cars();

                    if !chunk.last {
                        open = Some((chunk.hour, table));
                        continue;
                    }

                    let report = self.report(chunk.hour, &table);
                    tracing::debug!(
                        rank,
                        hour = %chunk.hour,
                        lights = table.len(),
                        entries = report.entries.len(),
                        "bucket aggregated"
                    );
                    summary.hours.push(chunk.hour);
                    transport
                        .send(COORDINATOR, &WireMessage::Report(report))
                        .await?;
                }
                other => {
                    return Err(TrafficError::Protocol(format!(
                        "worker {} expected DISPATCH or SENTINEL, got {}",
                        rank,
                        other.kind()
                    )))
                }
            }
        }

        transport.send(COORDINATOR, &WireMessage::ReportEnd).await?;
        tracing::info!(
            rank,
            buckets = summary.buckets(),
            records = summary.records,
            cars = summary.cars,
            "worker finished"
        );
        Ok(summary)
    }
}

impl Default for WorkerAggregator {
    fn default() -> Self {
        Self::new(2)
    }
}
