use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channel::{Gain, SensorAxis};
use crate::error::Error;
use crate::fitting::LeastSquares;
use crate::histogram::{BinGrid, DeadPosition, ProfileBuilder, DEFAULT_RESOLUTION};
use crate::linearity::LinearityConfig;
use crate::pedestal::{PedestalEstimator, PedestalPrior, PedestalTracker};
use crate::sample::TimeWindow;
use crate::solver::SolverConfig;
use crate::spectrum::SpectrumConfig;
use crate::transit::TransitConfig;
use crate::Result;

/// Session configuration, read from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Gains pedestals are estimated for
    pub gains: Vec<Gain>,
    /// Scale constant `S` of the rational calibration, per sensor axis
    pub scale: BTreeMap<SensorAxis, f64>,
    #[serde(default)]
    pub pedestal_priors: Vec<PedestalPrior>,
    #[serde(default)]
    pub estimator: PedestalEstimator,
    #[serde(default)]
    pub tracker: PedestalTracker,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub fit: LeastSquares,
    #[serde(default = "default_tolerance")]
    pub degenerate_tolerance: f64,
    #[serde(default)]
    pub transit: TransitConfig,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub linearity: Option<LinearityConfig>,
    #[serde(default, rename = "scan")]
    pub scans: Vec<ScanConfig>,
}

const fn default_tolerance() -> f64 {
    1e-12
}

const fn default_beam_scale() -> f64 {
    1.0
}

const fn default_resolution() -> f64 {
    DEFAULT_RESOLUTION
}

/// One calibration scan: where it was taken and how to bin it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub name: String,
    pub gain: Gain,
    #[serde(default)]
    pub window: TimeWindow,
    pub x: BinGrid,
    pub y: BinGrid,
    /// Positioner readback the calibration is derived around
    pub reference_x: f64,
    pub reference_y: f64,
    #[serde(default)]
    pub min_beam_current: f64,
    #[serde(default = "default_beam_scale")]
    pub beam_scale: f64,
    /// Smallest resolvable change of a normalized response, the floor of every bin error
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    #[serde(default)]
    pub dead: Vec<DeadPosition>,
    /// Bins of the other axis averaged into a profile; all of them when absent
    #[serde(default)]
    pub average_range: Option<[usize; 2]>,
}

impl ScanConfig {
    pub fn profile_builder(&self) -> ProfileBuilder {
        ProfileBuilder {
            x: self.x,
            y: self.y,
            min_beam_current: self.min_beam_current,
            beam_scale: self.beam_scale,
            resolution: self.resolution,
            dead: self.dead.clone(),
        }
    }

    pub fn average_range(&self) -> Option<Range<usize>> {
        self.average_range.map(|[start, end]| start..end)
    }

    fn validate(&self) -> Result<()> {
        self.x.validate()?;
        self.y.validate()?;
        if self.beam_scale <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "scan {:?} has beam scale {}",
                self.name, self.beam_scale
            )));
        }
        if self.resolution <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "scan {:?} has resolution {}",
                self.name, self.resolution
            )));
        }
        if let Some([start, end]) = self.average_range {
            if start >= end {
                return Err(Error::InvalidConfig(format!(
                    "scan {:?} averages the empty bin range {start}..{end}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Read and validate a configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid TOML for a [`Config`], or
    /// fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = fs::read_to_string(path)?;
        config.parse()
    }

    /// Scan named `name`
    ///
    /// # Errors
    /// Returns [`Error::UnknownScan`] if no scan has that name.
    pub fn scan(&self, name: &str) -> Result<&ScanConfig> {
        self.scans
            .iter()
            .find(|scan| scan.name == name)
            .ok_or_else(|| Error::UnknownScan(name.to_owned()))
    }

    /// Scale constant of `axis`
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the axis has none.
    pub fn scale(&self, axis: SensorAxis) -> Result<f64> {
        self.scale
            .get(&axis)
            .copied()
            .ok_or_else(|| Error::InvalidConfig(format!("no scale constant for {axis}")))
    }

    fn validate(&self) -> Result<()> {
        if self.gains.is_empty() {
            return Err(Error::InvalidConfig("no gains configured".into()));
        }
        for scan in &self.scans {
            scan.validate()?;
        }
        if let Some(linearity) = &self.linearity {
            linearity.grid.validate()?;
        }
        self.spectrum.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
