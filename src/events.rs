// SoundWatch - Pipeline Data Types

use std::time::Instant;

use crate::window::WindowStats;

// ---------------------------------------------------------------------------
// Reading: one decibel sample, the only message crossing the task channel
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value_db: f32,
    /// Monotonic time of acquisition.
    pub captured: Instant,
}

// ---------------------------------------------------------------------------
// Sensor site: fixed identity stamped on every aggregate
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSite {
    pub sensor_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

// ---------------------------------------------------------------------------
// Aggregate sample: the unit actually transmitted (or persisted)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSample {
    pub sensor_id: String,
    pub average_db: f32,
    pub min_db: f32,
    pub max_db: f32,
    pub latitude: f64,
    pub longitude: f64,
    /// Calendar time, `YYYY-MM-DD HH:MM:SS`.
    pub captured_at: String,
}

impl AggregateSample {
    pub fn new(site: &SensorSite, stats: WindowStats, captured_at: String) -> Self {
        Self {
            sensor_id: site.sensor_id.clone(),
            average_db: stats.average_db,
            min_db: stats.min_db,
            max_db: stats.max_db,
            latitude: site.latitude,
            longitude: site.longitude,
            captured_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Broker session events, delivered from the client callback to the publisher
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

// ---------------------------------------------------------------------------
// Display status: everything the display collaborator gets to see
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayStatus {
    pub value_db: f32,
    pub link_up: bool,
    pub broker_connected: bool,
}

impl DisplayStatus {
    /// Telemetry goes straight to the broker only when both hops are up.
    pub fn online(&self) -> bool {
        self.link_up && self.broker_connected
    }
}
