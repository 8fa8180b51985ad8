//! Magnitude spectra of the quadrant channels, used to find pickup frequencies.
//!
//! Readings are taken in records of `record_len` consecutive samples. Every record is
//! projected onto a cosine and a sine at each analysed frequency, using absolute sample
//! times so that consecutive records stay in phase. The projections of `coherent_records`
//! records are summed before the magnitude is taken and added to the spectrum, which
//! favours steady pickup over noise.

use std::f64::consts::TAU;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{Channel, Currents};
use crate::error::Error;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Seconds between readings within a record
    pub sample_period: f64,
    pub record_len: usize,
    /// Highest analysed frequency (Hz)
    pub max_frequency: f64,
    /// Records summed in phase before the magnitude is taken
    pub coherent_records: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            sample_period: 32.0 / 500_000.0,
            record_len: 8192,
            max_frequency: 500.0,
            coherent_records: 10,
        }
    }
}

impl SpectrumConfig {
    /// Frequency spacing, one over the record duration.
    #[allow(clippy::cast_precision_loss)]
    pub fn resolution(&self) -> f64 {
        1.0 / (self.record_len as f64 * self.sample_period)
    }

    /// Analysed frequencies: multiples of the resolution from zero up to the maximum.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn frequencies(&self) -> Array1<f64> {
        let resolution = self.resolution();
        let count = (self.max_frequency / resolution).ceil() as usize;
        (0..count).map(|k| k as f64 * resolution).collect()
    }

    /// # Errors
    /// Returns [`Error::InvalidConfig`] unless every setting is positive.
    pub fn validate(&self) -> Result<()> {
        if self.record_len == 0
            || self.coherent_records == 0
            || self.sample_period <= 0.0
            || self.max_frequency <= 0.0
        {
            return Err(Error::InvalidConfig(format!(
                "spectrum settings must be positive, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Summed magnitude per analysed frequency, for every channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    frequencies: Array1<f64>,
    // frequency x channel
    amplitude: Array2<f64>,
    records: usize,
}

impl Spectrum {
    pub const fn frequencies(&self) -> &Array1<f64> {
        &self.frequencies
    }

    pub fn amplitude(&self, channel: Channel) -> ArrayView1<'_, f64> {
        self.amplitude.column(channel.index())
    }

    /// Records that went into the spectrum.
    pub const fn records(&self) -> usize {
        self.records
    }

    /// Frequency of the strongest component of `channel` above zero, a starting point for
    /// a sinusoid fit.
    pub fn peak(&self, channel: Channel) -> Option<f64> {
        self.amplitude(channel)
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(bin, _)| self.frequencies[bin])
    }
}

pub struct SpectrumAccumulator {
    config: SpectrumConfig,
    frequencies: Array1<f64>,
    cosine: Array2<f64>,
    sine: Array2<f64>,
    amplitude: Array2<f64>,
    pending: usize,
    records: usize,
}

impl SpectrumAccumulator {
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for non-positive settings.
    pub fn new(config: SpectrumConfig) -> Result<Self> {
        config.validate()?;
        let frequencies = config.frequencies();
        let shape = (frequencies.len(), Channel::ALL.len());
        Ok(Self {
            config,
            frequencies,
            cosine: Array2::zeros(shape),
            sine: Array2::zeros(shape),
            amplitude: Array2::zeros(shape),
            pending: 0,
            records: 0,
        })
    }

    /// Add one record of `record_len` readings, the first taken at `start`.
    ///
    /// # Errors
    /// Returns [`Error::Shape`] if the record has the wrong length.
    #[allow(clippy::cast_precision_loss)]
    pub fn push_record(&mut self, start: f64, readings: &[Currents]) -> Result<()> {
        let len = self.config.record_len;
        if readings.len() != len {
            return Err(Error::Shape(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            )));
        }
        let data = Array2::from_shape_fn((len, Channel::ALL.len()), |(i, j)| readings[i].values()[j]);
        let phase = Array2::from_shape_fn((self.frequencies.len(), len), |(k, i)| {
            TAU * self.frequencies[k] * self.config.sample_period.mul_add(i as f64, start)
        });
        let norm = len as f64;
        self.cosine += &(phase.mapv(f64::cos).dot(&data) / norm);
        self.sine += &(phase.mapv(f64::sin).dot(&data) / norm);

        self.pending += 1;
        self.records += 1;
        if self.pending == self.config.coherent_records {
            self.flush();
        }
        Ok(())
    }

    fn flush(&mut self) {
        ndarray::Zip::from(&mut self.amplitude)
            .and(&self.cosine)
            .and(&self.sine)
            .for_each(|amplitude, &c, &s| *amplitude += c.hypot(s));
        self.cosine.fill(0.0);
        self.sine.fill(0.0);
        self.pending = 0;
    }

    /// The spectrum so far; a trailing incomplete group of records is included.
    pub fn finish(mut self) -> Spectrum {
        if self.pending > 0 {
            self.flush();
        }
        debug!(
            records = self.records,
            frequencies = self.frequencies.len(),
            "spectrum accumulated"
        );
        Spectrum {
            frequencies: self.frequencies,
            amplitude: self.amplitude,
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::TAU;

    use super::{Spectrum, SpectrumAccumulator, SpectrumConfig};
    use crate::channel::{Axis, Channel, Currents};
    use crate::error::Error;
    use crate::fitting::{FitService, LeastSquares, Model};
    use crate::histogram::{BinGrid, ResponseProfile, DEFAULT_RESOLUTION};
    use crate::Result;

    // 4 Hz resolution over 50 frequencies
    const CONFIG: SpectrumConfig = SpectrumConfig {
        sample_period: 1.0 / 1024.0,
        record_len: 256,
        max_frequency: 200.0,
        coherent_records: 2,
    };

    fn ixp() -> Channel {
        Channel::ALL[0]
    }

    fn oym() -> Channel {
        Channel::ALL[7]
    }

    /// 64 Hz ripple of amplitude 3 on ixp, 128 Hz of amplitude 1 on oym.
    fn reading(t: f64) -> Currents {
        let mut currents = Currents::new([10.0; 8]);
        currents[ixp()] = 3.0f64.mul_add((TAU * 64.0 * t).sin(), 100.0);
        currents[oym()] = (TAU * 128.0 * t).sin() + 50.0;
        currents
    }

    fn record(index: u32) -> (f64, Vec<Currents>) {
        let start = f64::from(index) * 0.25;
        let readings = (0..256)
            .map(|i| reading(CONFIG.sample_period.mul_add(f64::from(i), start)))
            .collect();
        (start, readings)
    }

    fn spectrum(records: u32) -> Result<Spectrum> {
        let mut accumulator = SpectrumAccumulator::new(CONFIG)?;
        for index in 0..records {
            let (start, readings) = record(index);
            accumulator.push_record(start, &readings)?;
        }
        Ok(accumulator.finish())
    }

    #[test]
    fn frequencies_step_by_the_inverse_record_duration() {
        let frequencies = CONFIG.frequencies();
        approx::assert_relative_eq!(CONFIG.resolution(), 4.0);
        assert_eq!(frequencies.len(), 50);
        approx::assert_relative_eq!(frequencies[16], 64.0);
    }

    #[test]
    fn ripple_peaks_at_its_frequency() -> Result<()> {
        let spectrum = spectrum(4)?;
        assert_eq!(spectrum.records(), 4);
        assert_eq!(spectrum.peak(ixp()), Some(64.0));
        assert_eq!(spectrum.peak(oym()), Some(128.0));

        // two groups of two records, each summing to twice the half amplitude
        approx::assert_relative_eq!(spectrum.amplitude(ixp())[16], 6.0, epsilon = 1e-9);
        approx::assert_relative_eq!(spectrum.amplitude(ixp())[0], 400.0, epsilon = 1e-9);
        assert!(spectrum.amplitude(ixp())[20] < 1e-9);
        Ok(())
    }

    #[test]
    fn trailing_records_are_flushed() -> Result<()> {
        let spectrum = spectrum(3)?;
        approx::assert_relative_eq!(spectrum.amplitude(ixp())[16], 4.5, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn short_records_are_rejected() -> Result<()> {
        let mut accumulator = SpectrumAccumulator::new(CONFIG)?;
        let (start, readings) = record(0);
        assert!(matches!(
            accumulator.push_record(start, &readings[..100]),
            Err(Error::Shape(_))
        ));
        assert!(SpectrumAccumulator::new(SpectrumConfig {
            record_len: 0,
            ..CONFIG
        })
        .is_err());
        Ok(())
    }

    #[test]
    fn peak_frequency_seeds_the_ripple_fit() -> Result<()> {
        let frequency = spectrum(2)?.peak(ixp()).unwrap();
        let grid = BinGrid::new(256, 0.0, 0.25)?;
        let points = (0..256).map(|bin| {
            let t = grid.center(bin);
            (t, reading(t)[ixp()])
        });
        let profile = ResponseProfile::from_points(Axis::X, grid, DEFAULT_RESOLUTION, points);

        let outcome = LeastSquares::default().fit(&profile, Model::Sinusoid { frequency })?;
        approx::assert_relative_eq!(outcome.parameters[0], 100.0, max_relative = 1e-6);
        approx::assert_relative_eq!(outcome.parameters[1].abs(), 3.0, max_relative = 1e-6);
        approx::assert_relative_eq!(outcome.parameters[2], 64.0, max_relative = 1e-6);
        Ok(())
    }
}
