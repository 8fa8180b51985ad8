//! Assemble quadrant samples from independently recorded channel streams.
//!
//! Each channel is written to its own record stream with its own timestamps. The first
//! channel (`ixp`) acts as the master clock; every other stream contributes the record
//! nearest in time, provided it lies within the sync tolerance.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{Channel, Currents, Gain};
use crate::sample::QuadrantSample;
use crate::Result;

/// One record of a single channel stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelRecord {
    pub timestamp: f64,
    pub value: f64,
    pub beam_current: f64,
    pub gain: Gain,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignConfig {
    /// Largest accepted time offset between the master record and a matched record.
    /// Must be below the interval between recordings.
    pub sync_delta: f64,
    /// Master records with a lower beam current are skipped
    pub current_threshold: f64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            sync_delta: 0.8,
            current_threshold: 10.0,
        }
    }
}

/// Index of the record in `stream` nearest to `timestamp`. `stream` must be sorted.
fn nearest(stream: &[ChannelRecord], timestamp: f64) -> Option<usize> {
    let after = stream.partition_point(|record| record.timestamp < timestamp);
    let before = after.checked_sub(1);
    match (before, (after < stream.len()).then_some(after)) {
        (Some(before), Some(after)) => {
            let d_before = (timestamp - stream[before].timestamp).abs();
            let d_after = (stream[after].timestamp - timestamp).abs();
            Some(if d_after < d_before { after } else { before })
        }
        (before, after) => before.or(after),
    }
}

/// Merge the eight channel streams, indexed in [`Channel::ALL`] order.
///
/// `positioner` supplies the mechanical readback `(x, y)` at a timestamp, or `None` when
/// there is none. Master records for which any stream has no record within `sync_delta`
/// are dropped with a warning, as are records without a readback.
///
/// # Errors
/// Propagates the first error of `positioner`.
pub fn align(
    streams: &[Vec<ChannelRecord>; 8],
    config: &AlignConfig,
    mut positioner: impl FnMut(f64) -> Result<Option<(f64, f64)>>,
) -> Result<Vec<QuadrantSample>> {
    let [master, others @ ..] = streams;
    let mut samples = vec![];

    'records: for (entry, record) in master.iter().enumerate() {
        if record.beam_current < config.current_threshold {
            continue;
        }
        let mut currents = Currents::default();
        currents[Channel::ALL[0]] = record.value;

        for (channel, stream) in Channel::ALL.into_iter().skip(1).zip(others) {
            let Some(index) = nearest(stream, record.timestamp) else {
                warn!(entry, %channel, "stream sync failed, channel has no records");
                continue 'records;
            };
            let offset = stream[index].timestamp - record.timestamp;
            if offset.abs() > config.sync_delta {
                warn!(entry, %channel, offset, "stream sync failed");
                continue 'records;
            }
            currents[channel] = stream[index].value;
        }

        let Some((reference_x, reference_y)) = positioner(record.timestamp)? else {
            warn!(entry, "no positioner readback");
            continue;
        };
        samples.push(QuadrantSample {
            timestamp: record.timestamp,
            gain: record.gain,
            currents,
            beam_current: record.beam_current,
            reference_x,
            reference_y,
        });
    }

    debug!(
        master_records = master.len(),
        aligned = samples.len(),
        "aligned channel streams"
    );
    Ok(samples)
}
