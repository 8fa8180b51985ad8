use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::{Coefficients, Parameterization};
use crate::channel::{Gain, SensorAxis};
use crate::error::Error;
use crate::Result;

/// Version written to, and required of, calibration snapshots
pub const SNAPSHOT_VERSION: u32 = 1;

/// Calibrations in use, keyed by gain, sensor axis and parameterization.
///
/// Coefficients are only ever replaced as a whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationStore {
    entries: BTreeMap<(Gain, SensorAxis, Parameterization), Coefficients>,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    gain: Gain,
    axis: SensorAxis,
    coefficients: Coefficients,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    calibration: Vec<Entry>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `coefficients` for `gain` and `axis`, returning the set they replace.
    pub fn replace(
        &mut self,
        gain: Gain,
        axis: SensorAxis,
        coefficients: Coefficients,
    ) -> Option<Coefficients> {
        self.entries
            .insert((gain, axis, coefficients.parameterization()), coefficients)
    }

    pub fn get(
        &self,
        gain: Gain,
        axis: SensorAxis,
        parameterization: Parameterization,
    ) -> Option<&Coefficients> {
        self.entries.get(&(gain, axis, parameterization))
    }

    /// # Errors
    /// Returns [`Error::MissingCalibration`] if nothing is stored under the key.
    pub fn require(
        &self,
        gain: Gain,
        axis: SensorAxis,
        parameterization: Parameterization,
    ) -> Result<&Coefficients> {
        self.get(gain, axis, parameterization)
            .ok_or(Error::MissingCalibration { gain, axis })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gain, SensorAxis, &Coefficients)> {
        self.entries
            .iter()
            .map(|(&(gain, axis, _), coefficients)| (gain, axis, coefficients))
    }

    /// # Errors
    /// Returns an error if the snapshot cannot be parsed or has another version.
    pub fn from_toml(snapshot: &str) -> Result<Self> {
        let snapshot: Snapshot = toml::from_str(snapshot)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "calibration snapshot version {} is not {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        let mut store = Self::new();
        for entry in snapshot.calibration {
            store.replace(entry.gain, entry.axis, entry.coefficients);
        }
        Ok(store)
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            calibration: self
                .iter()
                .map(|(gain, axis, coefficients)| Entry {
                    gain,
                    axis,
                    coefficients: *coefficients,
                })
                .collect(),
        };
        Ok(toml::to_string(&snapshot)?)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        let store = Self::from_toml(&fs::read_to_string(path)?)?;
        info!("loaded {} calibrations from {path:?}", store.len());
        Ok(store)
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        info!("saved {} calibrations to {path:?}", self.len());
        Ok(())
    }
}
