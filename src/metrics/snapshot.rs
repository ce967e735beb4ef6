use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time summary of the sample window.
/// Written into the shared region on every publish tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub count: usize,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub timestamp: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Summarize `values` (oldest first).
    /// An empty sequence yields the all-zero snapshot rather than NaN.
    pub fn from_samples<I>(values: I, timestamp: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values = values.into_iter();

        let Some(first) = values.next() else {
            return Self::empty(timestamp);
        };

        let mut count = 1usize;
        let mut sum = first;
        let mut minimum = first;
        let mut maximum = first;

        for v in values {
            count += 1;
            sum += v;
            // Plain comparisons: a NaN sample never replaces a running
            // extreme, but it does poison the average.
            if v < minimum {
                minimum = v;
            }
            if v > maximum {
                maximum = v;
            }
        }

        Self {
            count,
            average: sum / count as f64,
            minimum,
            maximum,
            timestamp,
        }
    }

    /// Zero placeholder used before any samples arrive.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            average: 0.0,
            minimum: 0.0,
            maximum: 0.0,
            timestamp,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}
