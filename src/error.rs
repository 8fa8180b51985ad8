use thiserror::Error;

use crate::channel::{Channel, Gain, SensorAxis};

#[derive(Debug, Error)]
pub enum Error {
    /// No valid samples to estimate a pedestal or fit a profile segment.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// A fit produced a calibration that cannot be inverted.
    #[error("degenerate calibration: {0}")]
    DegenerateCalibration(String),
    /// The quadratic position equation has no real root.
    #[error("no real position solution")]
    NoSolution,
    /// Combined plus/minus signal is too small for a meaningful solve.
    #[error("combined signal {combined} is not above the threshold {threshold}")]
    InsufficientSignal { combined: f64, threshold: f64 },
    #[error("no calibration for gain {gain} on {axis}")]
    MissingCalibration { gain: Gain, axis: SensorAxis },
    #[error("no pedestal for gain {gain} on {channel}")]
    MissingPedestal { gain: Gain, channel: Channel },
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("unknown scan {0:?}")]
    UnknownScan(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("minimisation failed: {0}")]
    Minimisation(argmin::core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

impl From<argmin::core::Error> for Error {
    fn from(value: argmin::core::Error) -> Self {
        Self::Minimisation(value)
    }
}

impl Error {
    /// Whether the error is an expected "no estimate" outcome of position solving.
    ///
    /// Live consumers display a sentinel for these and carry on; everything else is a
    /// real failure.
    pub const fn is_no_estimate(&self) -> bool {
        matches!(self, Self::NoSolution | Self::InsufficientSignal { .. })
    }
}
