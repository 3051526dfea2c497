//! Streaming top-N aggregation
//!
//! The consumer side of streaming mode: every event taken from the queue is
//! folded into a stream-wide [`CongestionTable`] and the ranking is rebuilt
//! from the full table.

use crate::model::{CongestionTable, Ranking, TrafficEvent};
use crate::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Width of the separator printed after each streaming ranking
const SEPARATOR_WIDTH: usize = 64;

/// Cumulative per-light aggregator for streaming mode
#[derive(Debug, Clone)]
pub struct StreamingAggregator {
    table: CongestionTable,
    top_n: usize,
    processed: u64,
}

impl StreamingAggregator {
    pub fn new(top_n: usize) -> Self {
        Self {
            table: CongestionTable::new(),
            top_n,
            processed: 0,
        }
    }

    /// Fold one event into the table and return the updated ranking
    pub fn apply(&mut self, event: &TrafficEvent) -> Ranking {
        self.table.record_event(event);
        self.processed += 1;
        self.ranking()
    }

    /// Current ranking without applying anything
    pub fn ranking(&self) -> Ranking {
        self.table.top_n(self.top_n)
    }

    pub fn table(&self) -> &CongestionTable {
        &self.table
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Events applied so far
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Consume `queue` until it is closed and drained.
    ///
    /// `on_update` sees every event together with the ranking right after it
    /// was applied.
    pub async fn run<F>(
        &mut self,
        queue: &BoundedQueue<TrafficEvent>,
        mut on_update: F,
    ) -> AggregateSummary
    where
        F: FnMut(&TrafficEvent, &Ranking),
    {
        while let Some(event) = queue.get().await {
            let ranking = self.apply(&event);
            tracing::trace!(
                light_id = event.light_id,
                cars_passed = event.cars_passed,
                lights = self.table.len(),
                "event aggregated"
            );
            on_update(&event, &ranking);
        }

        tracing::debug!(events = self.processed, "stream drained");
        AggregateSummary {
            events: self.processed,
            distinct_lights: self.table.len(),
            ranking: self.ranking(),
        }
    }
}

/// Outcome of one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    /// Events consumed from the queue
    pub events: u64,
    pub distinct_lights: usize,
    /// Ranking after the last event
    pub ranking: Ranking,
}

/// Render a streaming ranking block
pub fn render_ranking(ranking: &Ranking, top_n: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "Top {} traffic lights:", top_n);
    for entry in ranking.entries() {
        let _ = writeln!(out, "{}:- {} cars", entry.light_id, entry.count);
    }
    let _ = writeln!(out, "{}", "_".repeat(SEPARATOR_WIDTH));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RankedEntry;

    #[test]
    fn test_apply_accumulates_and_ranks() {
        let mut aggregator = StreamingAggregator::new(5);

        let ranking = aggregator.apply(&TrafficEvent::new("08:00", 1, 10));
        assert_eq!(ranking.entries(), &[RankedEntry::new(1, 10)]);

        let ranking = aggregator.apply(&TrafficEvent::new("08:05", 2, 15));
        assert_eq!(
            ranking.entries(),
            &[RankedEntry::new(2, 15), RankedEntry::new(1, 10)]
        );

        let ranking = aggregator.apply(&TrafficEvent::new("08:10", 1, 7));
        assert_eq!(
            ranking.entries(),
            &[RankedEntry::new(1, 17), RankedEntry::new(2, 15)]
        );
        assert_eq!(aggregator.processed(), 3);
    }

    #[test]
    fn test_apply_truncates_to_top_n() {
        let mut aggregator = StreamingAggregator::new(5);
        let mut ranking = Ranking::default();
        for light in 1..=8u32 {
            ranking = aggregator.apply(&TrafficEvent::new("09:00", light, light * 3));
        }
        assert_eq!(ranking.len(), 5);
        assert_eq!(ranking.entries()[0], RankedEntry::new(8, 24));
        assert_eq!(ranking.entries()[4], RankedEntry::new(4, 12));
        assert_eq!(aggregator.table().len(), 8);
    }

    #[test]
    fn test_every_ranking_sorted() {
        let mut aggregator = StreamingAggregator::new(3);
        let readings = [(4, 1), (2, 9), (4, 20), (7, 3), (2, 2), (9, 30), (7, 40)];
        for (light, cars) in readings {
            let ranking = aggregator.apply(&TrafficEvent::new("10:00", light, cars));
            assert!(ranking.is_sorted_desc());
            assert!(ranking.len() <= 3);
        }
    }

    #[test]
    fn test_zero_cars_still_creates_entry() {
        let mut aggregator = StreamingAggregator::new(5);
        let ranking = aggregator.apply(&TrafficEvent::new("10:00", 3, 0));
        assert_eq!(ranking.entries(), &[RankedEntry::new(3, 0)]);
    }

    #[tokio::test]
    async fn test_run_until_closed() {
        let queue = BoundedQueue::new(2).unwrap();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for (light, cars) in [(1, 5), (2, 8), (1, 4)] {
                    queue.put(TrafficEvent::new("07:00", light, cars)).await.unwrap();
                }
                queue.close().await;
            })
        };

        let mut aggregator = StreamingAggregator::new(5);
        let mut updates = Vec::new();
        let summary = aggregator
            .run(&queue, |event, ranking| {
                updates.push((event.light_id, ranking.clone()))
            })
            .await;
        producer.await.unwrap();

        assert_eq!(summary.events, 3);
        assert_eq!(summary.distinct_lights, 2);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[1].1.entries()[0], RankedEntry::new(2, 8));
        assert_eq!(
            summary.ranking.entries(),
            &[RankedEntry::new(1, 9), RankedEntry::new(2, 8)]
        );
    }

    #[test]
    fn test_render_ranking() {
        let ranking = Ranking::from_entries(vec![RankedEntry::new(3, 42), RankedEntry::new(1, 7)]);
        let rendered = render_ranking(&ranking, 5);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "Top 5 traffic lights:");
        assert_eq!(lines[2], "3:- 42 cars");
        assert_eq!(lines[3], "1:- 7 cars");
        assert_eq!(lines[4], "_".repeat(64));
    }
}
