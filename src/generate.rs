//! Random sample input

use crate::error::{Result, TrafficError};
use crate::ingest::RecordFormat;
use crate::model::{LightId, TrafficEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Largest `cars_passed` a generated reading can have (exclusive)
const MAX_CARS: u32 = 100;

/// Generator for plausible sensor readings over one day
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    events: usize,
    lights: LightId,
    seed: Option<u64>,
}

impl SampleGenerator {
    pub fn new(events: usize, lights: LightId) -> Self {
        Self {
            events,
            lights,
            seed: None,
        }
    }

    /// Fix the seed for reproducible output (builder pattern)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Readings sorted by timestamp, light ids in `1..=lights`
    pub fn generate(&self) -> Result<Vec<TrafficEvent>> {
        if self.lights == 0 {
            return Err(TrafficError::ConfigError(
                "at least one traffic light is required".to_string(),
            ));
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut readings: Vec<(u16, TrafficEvent)> = (0..self.events)
            .map(|_| {
                let minute_of_day: u16 = rng.gen_range(0..24 * 60);
                let timestamp = format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60);
                let light_id = rng.gen_range(1..=self.lights);
                let cars = rng.gen_range(0..MAX_CARS);
                (minute_of_day, TrafficEvent::new(timestamp, light_id, cars))
            })
            .collect();
        readings.sort_by_key(|(minute, _)| *minute);
        Ok(readings.into_iter().map(|(_, event)| event).collect())
    }

    /// Generate and write one record per line to `path`
    pub async fn write_to(&self, path: &Path, format: RecordFormat) -> Result<usize> {
        let events = self.generate()?;
        let mut out = String::with_capacity(events.len() * 16);
        for event in &events {
            out.push_str(&format_record(event, format));
            out.push('\n');
        }

        tokio::fs::write(path, out)
            .await
            .map_err(|e| TrafficError::Other(format!("writing {}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), events = events.len(), "sample input written");
        Ok(events.len())
    }
}

/// Format one record as an input line; `Auto` writes the comma form
pub fn format_record(event: &TrafficEvent, format: RecordFormat) -> String {
    match format {
        RecordFormat::Whitespace => format!(
            "{} {} {}",
            event.timestamp, event.light_id, event.cars_passed
        ),
        RecordFormat::CommaSpace | RecordFormat::Auto => format!(
            "{}, {}, {}",
            event.timestamp, event.light_id, event.cars_passed
        ),
    }
}
