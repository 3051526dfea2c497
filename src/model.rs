//! Congestion data model shared by the streaming and distributed modes
//!
//! Both modes fold [`TrafficEvent`]s into a [`CongestionTable`] and rank it
//! with the same algorithm: count descending, ties broken by ascending
//! light id, truncated to the mode's `N`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Traffic light identifier
pub type LightId = u32;

/// A single sensor reading
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficEvent {
    /// Raw timestamp; the first two characters are the hour of day
    pub timestamp: String,
    /// Light that produced the reading
    pub light_id: LightId,
    /// Cars that passed the light in this reading
    pub cars_passed: u32,
}

impl TrafficEvent {
    /// Create a new traffic event
    pub fn new(timestamp: impl Into<String>, light_id: LightId, cars_passed: u32) -> Self {
        Self {
            timestamp: timestamp.into(),
            light_id,
            cars_passed,
        }
    }

    /// Hour bucket of this event, `None` when the timestamp has no valid hour prefix
    pub fn hour(&self) -> Option<Hour> {
        Hour::from_timestamp(&self.timestamp)
    }
}

/// Hour of day, `0..=23`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hour(u8);

impl Hour {
    /// Number of hour buckets in a day
    pub const COUNT: u8 = 24;

    /// Create an hour, `None` when `value >= 24`
    pub fn new(value: u8) -> Option<Self> {
        (value < Self::COUNT).then_some(Self(value))
    }

    /// Extract the hour from the leading two characters of a timestamp.
    ///
    /// Both characters must be ASCII digits and form a value below 24.
    pub fn from_timestamp(timestamp: &str) -> Option<Self> {
        match timestamp.as_bytes() {
            [tens, ones, ..] if tens.is_ascii_digit() && ones.is_ascii_digit() => {
                Self::new((tens - b'0') * 10 + (ones - b'0'))
            }
            _ => None,
        }
    }

    /// Numeric value of the hour
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Hour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00", self.0)
    }
}

/// One line of a ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub light_id: LightId,
    pub count: u64,
}

impl RankedEntry {
    pub fn new(light_id: LightId, count: u64) -> Self {
        Self { light_id, count }
    }
}

/// Top-N ranking sorted by count descending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    entries: Vec<RankedEntry>,
}

impl Ranking {
    /// Wrap entries that are already in ranking order (e.g. decoded from a report)
    pub fn from_entries(entries: Vec<RankedEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<RankedEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every entry's count is at least the next entry's count
    pub fn is_sorted_desc(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].count >= w[1].count)
    }
}

/// Rank `(light_id, count)` pairs: count descending, light id ascending, first `n`
pub fn rank_top_n<I>(counts: I, n: usize) -> Ranking
where
    I: IntoIterator<Item = (LightId, u64)>,
{
    let mut entries: Vec<RankedEntry> = counts
        .into_iter()
        .map(|(light_id, count)| RankedEntry::new(light_id, count))
        .collect();
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.light_id.cmp(&b.light_id))
    });
    entries.truncate(n);
    Ranking { entries }
}

/// Cumulative cars per light within one scope (whole stream or one hour)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CongestionTable {
    counts: HashMap<LightId, u64>,
}

impl CongestionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `cars` to a light's total and return the new total
    pub fn record(&mut self, light_id: LightId, cars: u32) -> u64 {
        let total = self.counts.entry(light_id).or_insert(0);
        *total += u64::from(cars);
        *total
    }

    /// Fold one event into the table
    pub fn record_event(&mut self, event: &TrafficEvent) -> u64 {
        self.record(event.light_id, event.cars_passed)
    }

    pub fn get(&self, light_id: LightId) -> Option<u64> {
        self.counts.get(&light_id).copied()
    }

    /// Number of distinct lights
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts in the table
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    /// Current top-`n` ranking of the table
    pub fn top_n(&self, n: usize) -> Ranking {
        rank_top_n(self.counts.iter().map(|(id, count)| (*id, *count)), n)
    }
}

impl<'a> Extend<&'a TrafficEvent> for CongestionTable {
    fn extend<T: IntoIterator<Item = &'a TrafficEvent>>(&mut self, iter: T) {
        for event in iter {
            self.record_event(event);
        }
    }
}

impl<'a> FromIterator<&'a TrafficEvent> for CongestionTable {
    fn from_iter<T: IntoIterator<Item = &'a TrafficEvent>>(iter: T) -> Self {
        let mut table = Self::new();
        table.extend(iter);
        table
    }
}
