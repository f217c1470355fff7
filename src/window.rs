// SoundWatch - Aggregation Window
//
// Accumulates decibel readings over a fixed span and reports average, min
// and max when the span closes. Time is whatever monotonic instant the caller
// sampled with the reading, so the effective window length jitters by up to
// one poll interval.

use std::time::{Duration, Instant};

/// Statistics of one closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub average_db: f32,
    pub min_db: f32,
    pub max_db: f32,
    pub samples: u32,
}

#[derive(Debug, Clone)]
pub struct AggregationWindow {
    length: Duration,
    sum: f64,
    count: u32,
    max: f32,
    min: f32,
    window_start: Instant,
}

impl AggregationWindow {
    pub fn new(length: Duration, now: Instant) -> Self {
        Self {
            length,
            sum: 0.0,
            count: 0,
            max: 0.0,
            min: 0.0,
            window_start: now,
        }
    }

    pub fn observe(&mut self, value: f32) {
        // The first value of a window seeds both extremes.
        if self.count == 0 {
            self.max = value;
            self.min = value;
        } else {
            self.max = self.max.max(value);
            self.min = self.min.min(value);
        }
        self.sum += f64::from(value);
        self.count += 1;
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.length
    }

    /// Close the window and start the next one at `now`.
    ///
    /// Returns `None` when nothing was observed; the window still restarts.
    pub fn flush(&mut self, now: Instant) -> Option<WindowStats> {
        let stats = (self.count > 0).then(|| WindowStats {
            average_db: (self.sum / f64::from(self.count)) as f32,
            min_db: self.min,
            max_db: self.max,
            samples: self.count,
        });

        self.sum = 0.0;
        self.count = 0;
        self.window_start = now;
        stats
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
