use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::{Channel, Currents};

/// Direction of a beam transit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// A point where the monitored current jumped.
#[derive(Clone, Debug, PartialEq)]
pub struct Transit {
    pub timestamp: f64,
    pub edge: Edge,
    /// All eight channels over the `record_len` readings ending at the edge, oldest first,
    /// to compare how the streams followed the jump
    pub capture: Vec<(f64, Currents)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitConfig {
    /// Readings held before the oldest is compared with the newest
    pub record_len: usize,
    /// Only changes faster than this (s) count as transits
    pub lookback: f64,
    /// Smallest change counted as a transit
    pub threshold: f64,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            record_len: 500,
            lookback: 0.3,
            threshold: 200.0,
        }
    }
}

/// Finds beam trips and recoveries on one monitored channel of a `(timestamp, currents)`
/// stream.
///
/// A transit is reported at the newest reading when the monitored value differs by more
/// than the threshold from the reading `record_len` entries earlier, and that reading lies
/// within the lookback time. The record is emptied after each transit so one jump is
/// reported once.
#[derive(Clone, Debug)]
pub struct TransitDetector {
    config: TransitConfig,
    channel: Channel,
    record: VecDeque<(f64, Currents)>,
}

impl TransitDetector {
    pub fn new(config: TransitConfig, channel: Channel) -> Self {
        Self {
            config,
            channel,
            record: VecDeque::with_capacity(config.record_len + 1),
        }
    }

    pub fn push(&mut self, timestamp: f64, currents: Currents) -> Option<Transit> {
        self.record.push_back((timestamp, currents));
        if self.record.len() <= self.config.record_len {
            return None;
        }
        let (oldest_time, oldest) = self.record.pop_front()?;
        if timestamp - oldest_time >= self.config.lookback {
            return None;
        }

        let (oldest_value, value) = (oldest[self.channel], currents[self.channel]);
        let edge = if oldest_value - value > self.config.threshold {
            Edge::Falling
        } else if value - oldest_value > self.config.threshold {
            Edge::Rising
        } else {
            return None;
        };
        info!(timestamp, ?edge, channel = %self.channel, "transit");
        Some(Transit {
            timestamp,
            edge,
            capture: self.record.drain(..).collect(),
        })
    }

    /// Every transit in `stream`.
    pub fn detect(&mut self, stream: impl IntoIterator<Item = (f64, Currents)>) -> Vec<Transit> {
        stream
            .into_iter()
            .filter_map(|(timestamp, currents)| self.push(timestamp, currents))
            .collect()
    }
}
