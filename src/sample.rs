use serde::{Deserialize, Serialize};

use crate::channel::{Currents, Gain};

/// One measurement of the collimator.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadrantSample {
    /// Seconds since the epoch
    pub timestamp: f64,
    pub gain: Gain,
    /// Raw ADC sums, one per channel
    pub currents: Currents,
    /// Incident beam intensity
    pub beam_current: f64,
    /// Mechanical positioner readback
    pub reference_x: f64,
    pub reference_y: f64,
}

/// Half-open time interval `[start, end)` in epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub const ALL: Self = Self {
        start: f64::NEG_INFINITY,
        end: f64::INFINITY,
    };

    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: f64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::ALL
    }
}
