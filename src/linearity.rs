//! Channel response against beam intensity, combined over several runs.
//!
//! Runs taken with different radiators or gains each give a profile of the channel current
//! in nA, `log10 |I - pedestal|`, against `log10` beam intensity. The profiles are merged
//! onto one fine grid and fitted with a straight line, whose slope is one for a linear
//! channel.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{Axis, Channel, Gain};
use crate::error::Error;
use crate::fitting::{FitOutcome, FitService, Model};
use crate::histogram::{BinGrid, ResponseProfile, DEFAULT_RESOLUTION};
use crate::pedestal::PedestalSet;
use crate::sample::{QuadrantSample, TimeWindow};
use crate::Result;

const fn default_systematic() -> f64 {
    0.02
}

const fn default_min_beam_current() -> f64 {
    3.0
}

const fn default_intensity_scale() -> f64 {
    1.0
}

const fn default_volts_per_count() -> f64 {
    10.0 / 2048.0
}

const fn default_resolution() -> f64 {
    DEFAULT_RESOLUTION
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearityConfig {
    /// Target binning in `log10` intensity
    pub grid: BinGrid,
    /// Added in quadrature to every merged bin error
    #[serde(default = "default_systematic")]
    pub systematic: f64,
    #[serde(default = "default_min_beam_current")]
    pub min_beam_current: f64,
    /// ADC full scale over its count range
    #[serde(default = "default_volts_per_count")]
    pub volts_per_count: f64,
    /// Error floor of a profile bin, in decades
    #[serde(default = "default_resolution")]
    pub resolution: f64,
}

/// One run of a linearity scan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearityRun {
    pub window: TimeWindow,
    /// Converts beam current to intensity on the collimator, e.g. the radiator thickness
    /// over that of the reference radiator
    #[serde(default = "default_intensity_scale")]
    pub intensity_scale: f64,
}

impl LinearityRun {
    pub const fn new(window: TimeWindow, intensity_scale: f64) -> Self {
        Self {
            window,
            intensity_scale,
        }
    }
}

impl LinearityConfig {
    pub const fn new(grid: BinGrid) -> Self {
        Self {
            grid,
            systematic: default_systematic(),
            min_beam_current: default_min_beam_current(),
            volts_per_count: default_volts_per_count(),
            resolution: default_resolution(),
        }
    }

    /// Pedestal-subtracted `counts` read at `gain`, in nA.
    pub fn nanoamps(&self, counts: f64, gain: Gain) -> f64 {
        counts * self.volts_per_count / gain.transimpedance() * 1e9
    }

    /// `log10` of the `channel` current in nA against `log10` intensity, on this config's
    /// grid.
    ///
    /// `samples` should come from a single run at a single gain; `intensity_scale` is the
    /// run's.
    ///
    /// # Errors
    /// Returns an error if a sample above the beam current cut has no pedestal.
    pub fn intensity_profile(
        &self,
        samples: &[QuadrantSample],
        pedestals: &PedestalSet,
        channel: Channel,
        intensity_scale: f64,
    ) -> Result<ResponseProfile> {
        let mut points = vec![];
        for sample in samples
            .iter()
            .filter(|sample| sample.beam_current > self.min_beam_current)
        {
            let current = self.nanoamps(pedestals.subtract(sample)?[channel].abs(), sample.gain);
            if current > 0.0 {
                points.push((
                    (sample.beam_current * intensity_scale).log10(),
                    current.log10(),
                ));
            }
        }
        Ok(ResponseProfile::from_points(
            Axis::X,
            self.grid,
            self.resolution,
            points,
        ))
    }

    /// Combine `profiles` by inverse-variance weighting onto the config grid.
    ///
    /// Every weighted source bin lands in the target bin containing its center.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] if no profile has a weighted bin on the grid.
    pub fn merge(&self, profiles: &[ResponseProfile]) -> Result<ResponseProfile> {
        let bins = self.grid.bins;
        let mut weight = Array1::<f64>::zeros(bins);
        let mut weighted = Array1::<f64>::zeros(bins);
        let mut count = Array1::<u32>::zeros(bins);

        for bin in profiles
            .iter()
            .flat_map(ResponseProfile::bins)
            .filter(|bin| bin.weight() > 0.0)
        {
            if let Some(target) = self.grid.find_bin(bin.center) {
                let w = bin.weight();
                weight[target] += w;
                weighted[target] += w * bin.value;
                count[target] += bin.count;
            }
        }
        if weight.iter().all(|&w| w == 0.0) {
            return Err(Error::InsufficientData(
                "no profile has a weighted bin on the linearity grid".into(),
            ));
        }

        let content = ndarray::Zip::from(&weighted)
            .and(&weight)
            .map_collect(|&sum, &w| if w > 0.0 { sum / w } else { 0.0 });
        let error = weight.mapv(|w| {
            if w > 0.0 {
                (1.0 / w + self.systematic.powi(2)).sqrt()
            } else {
                0.0
            }
        });
        debug!(
            "merged {} profiles into {} filled bins",
            profiles.len(),
            weight.iter().filter(|&&w| w > 0.0).count()
        );
        ResponseProfile::from_bins(Axis::X, self.grid, content, error, count)
    }

    /// Merge `profiles` and fit the result with a straight line.
    ///
    /// # Errors
    /// As [`Self::merge`], plus any fit error.
    pub fn calibrate(&self, profiles: &[ResponseProfile], service: &impl FitService) -> Result<FitOutcome> {
        service.fit(&self.merge(profiles)?, Model::Linear)
    }
}
