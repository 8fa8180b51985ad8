//! Cached lookups against a time-series archive.
//!
//! The archive stores, per named channel, a sequence of `(ticks, value)` records, where a
//! tick is 2^-28 s. A lookup takes epoch seconds and returns the most recent record at or
//! before the requested time. Records are cached per
//! channel as a window around the last request; requests past the newest cached record
//! fast-forward the window and requests before the oldest rewind it.

use std::collections::HashMap;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::align::{align, AlignConfig, ChannelRecord};
use crate::channel::{Channel, Currents, Gain};
use crate::error::Error;
use crate::sample::{QuadrantSample, TimeWindow};
use crate::Result;

/// Archive timestamps count 2^-28 s ticks since the epoch
pub const TICKS_PER_SECOND: f64 = (1u64 << 28) as f64;

pub fn to_archive_time(seconds: f64) -> f64 {
    seconds * TICKS_PER_SECOND
}

pub fn from_archive_time(ticks: f64) -> f64 {
    ticks / TICKS_PER_SECOND
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArchiveRecord {
    /// Archive ticks since the epoch
    pub ticks: f64,
    pub value: f64,
}

impl ArchiveRecord {
    /// Epoch seconds of the record.
    pub fn timestamp(&self) -> f64 {
        from_archive_time(self.ticks)
    }

    fn gain(&self) -> Result<Gain> {
        let code = self.value.round().to_u8().ok_or_else(|| {
            Error::InvalidConfig(format!("archived gain {} is not a gain code", self.value))
        })?;
        Ok(Gain(code))
    }
}

/// Query interface of the archive store.
pub trait ArchiveBackend {
    /// Up to `limit` records of `channel` at or before `ticks`, newest first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be queried.
    fn fetch_before(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>>;

    /// Up to `limit` records of `channel` at or after `ticks`, oldest first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be queried.
    fn fetch_from(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>>;
}

/// An archive held in memory, records sorted by time.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    channels: HashMap<String, Vec<ArchiveRecord>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_channel(mut self, name: &str, mut records: Vec<ArchiveRecord>) -> Self {
        records.sort_by(|a, b| a.ticks.total_cmp(&b.ticks));
        self.channels.insert(name.to_owned(), records);
        self
    }

    fn records(&self, channel: &str) -> &[ArchiveRecord] {
        self.channels.get(channel).map_or(&[], Vec::as_slice)
    }
}

impl ArchiveBackend for MemoryArchive {
    fn fetch_before(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>> {
        let records = self.records(channel);
        let end = records.partition_point(|record| record.ticks <= ticks);
        Ok(records[..end].iter().rev().take(limit).copied().collect())
    }

    fn fetch_from(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>> {
        let records = self.records(channel);
        let start = records.partition_point(|record| record.ticks < ticks);
        Ok(records[start..].iter().take(limit).copied().collect())
    }
}

/// Archive channel names feeding a [`QuadrantSample`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveChannels {
    /// Current channels in [`Channel::ALL`] order
    pub currents: [String; 8],
    /// Holds the gain code
    pub gain: String,
    pub beam_current: String,
    pub motor_x: String,
    pub motor_y: String,
}

pub struct ArchiveReader<B> {
    backend: B,
    window: usize,
    // Oldest first
    cache: HashMap<String, Vec<ArchiveRecord>>,
}

impl<B: ArchiveBackend> ArchiveReader<B> {
    pub const DEFAULT_WINDOW: usize = 1000;

    pub fn new(backend: B) -> Self {
        Self::with_window(backend, Self::DEFAULT_WINDOW)
    }

    /// `window` is the number of records cached per channel; at least two.
    pub fn with_window(backend: B, window: usize) -> Self {
        Self {
            backend,
            window: window.max(2),
            cache: HashMap::new(),
        }
    }

    fn refresh(&mut self, channel: &str, ticks: f64) -> Result<()> {
        let before = self.backend.fetch_before(channel, ticks, self.window / 2)?;
        let records = match before.last() {
            Some(oldest) => self.backend.fetch_from(channel, oldest.ticks, self.window)?,
            None => vec![],
        };
        debug!(channel, records = records.len(), "archive window updated");
        self.cache.insert(channel.to_owned(), records);
        Ok(())
    }

    /// The most recent record of `channel` at or before `timestamp` (epoch seconds).
    ///
    /// Returns `None` when the archive holds nothing that early.
    ///
    /// # Errors
    /// Returns an error if the backend query fails.
    pub fn lookup(&mut self, channel: &str, timestamp: f64) -> Result<Option<ArchiveRecord>> {
        let ticks = to_archive_time(timestamp);
        let bounds = self
            .cache
            .get(channel)
            .and_then(|records| Some((records.first()?, records.last()?)));
        let stale = match bounds {
            Some((_, newest)) if newest.ticks < ticks => {
                info!(channel, "fast-forward");
                true
            }
            Some((oldest, _)) if oldest.ticks > ticks => {
                info!(channel, "rewind");
                true
            }
            Some(_) => false,
            None => true,
        };
        if stale {
            self.refresh(channel, ticks)?;
        }

        let records = self.cache.get(channel).map_or(&[][..], Vec::as_slice);
        let end = records.partition_point(|record| record.ticks <= ticks);
        Ok(end.checked_sub(1).map(|index| records[index]))
    }

    /// Assemble the collimator state at `timestamp` from archived channels.
    ///
    /// Returns `None` if any of the channels has no record at or before `timestamp`.
    ///
    /// # Errors
    /// Returns an error if a backend query fails or the archived gain is not a valid code.
    pub fn sample_at(
        &mut self,
        channels: &ArchiveChannels,
        timestamp: f64,
    ) -> Result<Option<QuadrantSample>> {
        let mut currents = Currents::default();
        for (channel, name) in Channel::ALL.into_iter().zip(&channels.currents) {
            let Some(record) = self.lookup(name, timestamp)? else {
                return Ok(None);
            };
            currents[channel] = record.value;
        }
        let lookups = (
            self.lookup(&channels.gain, timestamp)?,
            self.lookup(&channels.beam_current, timestamp)?,
            self.lookup(&channels.motor_x, timestamp)?,
            self.lookup(&channels.motor_y, timestamp)?,
        );
        let (Some(gain), Some(beam_current), Some(motor_x), Some(motor_y)) = lookups else {
            return Ok(None);
        };

        Ok(Some(QuadrantSample {
            timestamp,
            gain: gain.gain()?,
            currents,
            beam_current: beam_current.value,
            reference_x: motor_x.value,
            reference_y: motor_y.value,
        }))
    }

    /// Every record of `channel` inside `window`, oldest first, paged through the backend
    /// `window` records at a time. Bypasses the lookup cache.
    fn records_in(&self, channel: &str, window: &TimeWindow) -> Result<Vec<ArchiveRecord>> {
        let mut records: Vec<ArchiveRecord> = vec![];
        let mut ticks = to_archive_time(window.start);
        loop {
            let page = self.backend.fetch_from(channel, ticks, self.window)?;
            let full = page.len() == self.window;
            let newest = records.last().map_or(f64::NEG_INFINITY, |record| record.ticks);
            for record in page {
                if record.ticks <= newest {
                    continue;
                }
                if !window.contains(record.timestamp()) {
                    return Ok(records);
                }
                records.push(record);
            }
            match records.last() {
                Some(last) if full && last.ticks > newest => ticks = last.ticks,
                _ => return Ok(records),
            }
        }
    }

    /// Samples inside `window` built from the separately archived current channels.
    ///
    /// Every current record is tagged with the gain and beam current in effect at its time
    /// and the streams are merged on the `ixp` clock; see [`align`]. Records recorded
    /// before any gain or beam current are left out.
    ///
    /// # Errors
    /// Returns an error if a backend query fails or an archived gain is not a valid code.
    pub fn aligned_samples(
        &mut self,
        channels: &ArchiveChannels,
        window: &TimeWindow,
        config: &AlignConfig,
    ) -> Result<Vec<QuadrantSample>> {
        let mut streams: [Vec<ChannelRecord>; 8] = Default::default();
        for (stream, name) in streams.iter_mut().zip(&channels.currents) {
            for record in self.records_in(name, window)? {
                let timestamp = record.timestamp();
                let (Some(gain), Some(beam_current)) = (
                    self.lookup(&channels.gain, timestamp)?,
                    self.lookup(&channels.beam_current, timestamp)?,
                ) else {
                    continue;
                };
                stream.push(ChannelRecord {
                    timestamp,
                    value: record.value,
                    beam_current: beam_current.value,
                    gain: gain.gain()?,
                });
            }
        }
        align(&streams, config, |timestamp| {
            let x = self.lookup(&channels.motor_x, timestamp)?;
            let y = self.lookup(&channels.motor_y, timestamp)?;
            Ok(x.zip(y).map(|(x, y)| (x.value, y.value)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::{
        from_archive_time, to_archive_time, ArchiveBackend, ArchiveChannels, ArchiveReader,
        ArchiveRecord, MemoryArchive,
    };
    use crate::align::AlignConfig;
    use crate::channel::Gain;
    use crate::sample::TimeWindow;
    use crate::Result;

    /// Counts backend queries to observe cache refreshes.
    struct Counting {
        inner: MemoryArchive,
        queries: Cell<usize>,
    }

    impl ArchiveBackend for Counting {
        fn fetch_before(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>> {
            self.queries.set(self.queries.get() + 1);
            self.inner.fetch_before(channel, ticks, limit)
        }

        fn fetch_from(&self, channel: &str, ticks: f64, limit: usize) -> Result<Vec<ArchiveRecord>> {
            self.inner.fetch_from(channel, ticks, limit)
        }
    }

    /// A record every ten seconds.
    fn ramp(n: u32) -> Vec<ArchiveRecord> {
        (0..n)
            .map(|t| ArchiveRecord {
                ticks: to_archive_time(f64::from(t) * 10.0),
                value: f64::from(t),
            })
            .collect()
    }

    #[test]
    fn archive_time_round_trips_through_ticks() {
        approx::assert_relative_eq!(to_archive_time(1.0), 268_435_456.0);
        approx::assert_relative_eq!(from_archive_time(to_archive_time(1_598_049_000.0)), 1_598_049_000.0);
    }

    #[test]
    fn lookup_returns_most_recent_record_at_or_before() -> Result<()> {
        let archive = MemoryArchive::new().with_channel("cur", ramp(100));
        let mut reader = ArchiveReader::with_window(archive, 10);

        let record = reader.lookup("cur", 55.0)?.unwrap();
        assert_eq!(record.value, 5.0);
        approx::assert_relative_eq!(record.timestamp(), 50.0);
        approx::assert_relative_eq!(record.ticks, 50.0 * 268_435_456.0);
        assert_eq!(reader.lookup("cur", 60.0)?.map(|r| r.value), Some(6.0));
        assert_eq!(reader.lookup("cur", -1.0)?, None);
        assert_eq!(reader.lookup("missing", 60.0)?, None);
        Ok(())
    }

    #[test]
    fn window_is_refreshed_only_outside_cached_range() -> Result<()> {
        let backend = Counting {
            inner: MemoryArchive::new().with_channel("cur", ramp(1000)),
            queries: Cell::new(0),
        };
        let mut reader = ArchiveReader::with_window(backend, 20);

        // Window covers records 40..60 after the first query.
        assert_eq!(reader.lookup("cur", 495.0)?.map(|r| r.value), Some(49.0));
        assert_eq!(reader.backend.queries.get(), 1);
        assert_eq!(reader.lookup("cur", 555.0)?.map(|r| r.value), Some(55.0));
        assert_eq!(reader.backend.queries.get(), 1);

        // Fast-forward
        assert_eq!(reader.lookup("cur", 5000.0)?.map(|r| r.value), Some(500.0));
        assert_eq!(reader.backend.queries.get(), 2);

        // Rewind
        assert_eq!(reader.lookup("cur", 10.0)?.map(|r| r.value), Some(1.0));
        assert_eq!(reader.backend.queries.get(), 3);
        Ok(())
    }

    fn names() -> ArchiveChannels {
        ArchiveChannels {
            currents: std::array::from_fn(|ii| format!("adc{ii}")),
            gain: "gain".to_owned(),
            beam_current: "cur".to_owned(),
            motor_x: "xmo".to_owned(),
            motor_y: "ymo".to_owned(),
        }
    }

    fn at(seconds: f64, value: f64) -> ArchiveRecord {
        ArchiveRecord {
            ticks: to_archive_time(seconds),
            value,
        }
    }

    #[test]
    fn samples_are_assembled_from_archived_channels() -> Result<()> {
        let names = names();
        let constant = |value| vec![ArchiveRecord { ticks: 0.0, value }];
        let mut archive = MemoryArchive::new()
            .with_channel("gain", constant(4.0))
            .with_channel("cur", constant(150.0))
            .with_channel("xmo", constant(-114.9))
            .with_channel("ymo", constant(5.3));
        for (ii, name) in names.currents.iter().enumerate() {
            archive = archive.with_channel(name, constant(ii as f64 * 10.0));
        }
        let mut reader = ArchiveReader::new(archive);

        let sample = reader.sample_at(&names, 100.0)?.expect("all channels archived");
        assert_eq!(sample.gain, Gain(4));
        approx::assert_relative_eq!(sample.currents.values()[3], 30.0);
        approx::assert_relative_eq!(sample.reference_x, -114.9);

        assert!(reader.sample_at(&names, -5.0)?.is_none());
        Ok(())
    }

    #[test]
    fn archived_streams_are_aligned_inside_the_window() -> Result<()> {
        let names = names();
        // Beam drops below the alignment threshold between 3 s and 4 s.
        let mut archive = MemoryArchive::new()
            .with_channel("gain", vec![at(0.0, 3.0), at(5.0, 4.0)])
            .with_channel("cur", vec![at(0.0, 150.0), at(3.0, 2.0), at(4.0, 150.0)])
            .with_channel("xmo", vec![at(0.0, -114.5)])
            .with_channel("ymo", vec![at(0.0, 5.0)]);
        for (ii, name) in names.currents.iter().enumerate() {
            let offset = 0.01 * ii as f64;
            let stream = (0..10)
                .map(|t| at(f64::from(t) + offset, 100.0 * ii as f64 + f64::from(t)))
                .collect();
            archive = archive.with_channel(name, stream);
        }
        // Pages of three records force repeated backend queries per channel.
        let mut reader = ArchiveReader::with_window(archive, 3);

        let samples = reader.aligned_samples(&names, &TimeWindow::new(1.0, 7.0), &AlignConfig::default())?;
        let timestamps = samples.iter().map(|s| s.timestamp.round()).collect::<Vec<_>>();
        assert_eq!(timestamps, vec![1.0, 2.0, 4.0, 5.0, 6.0]);

        let last = &samples[4];
        assert_eq!(last.gain, Gain(4));
        approx::assert_relative_eq!(last.currents.values()[5], 506.0);
        approx::assert_relative_eq!(last.reference_x, -114.5);
        assert_eq!(samples[0].gain, Gain(3));
        Ok(())
    }
}
