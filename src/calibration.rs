//! Derive position calibrations from plus/minus response profiles.
//!
//! Each channel of a sensor axis is fitted with a quadratic in the displacement
//! `u = x - x_ref` from the calibration reference:
//!
//! `I(u) = cross + slope u + curvature u^2`
//!
//! Two inversions of the plus/minus pair are derived from the same fits. The rational
//! form
//!
//! `u = S (Ip - R Im + P) / (Ip + R Im + Q)`
//!
//! is exact for linear responses, and the quadratic form eliminates the unknown source
//! intensity from the ratio of the two channel polynomials, leaving
//! `A u^2 + B u + C = 0` for each measured pair.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Error;
use crate::fitting::{FitOutcome, FitService, Model};
use crate::histogram::ResponseProfile;
use crate::Result;

/// Minimum number of weighted bins for a quadratic fit with a residual degree of freedom
const MIN_USABLE_BINS: usize = 3;

/// Quadratic response of one channel around the reference position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    /// Response at the reference
    pub cross: f64,
    pub slope: f64,
    pub curvature: f64,
}

impl ChannelResponse {
    fn from_outcome(outcome: &FitOutcome) -> Self {
        Self {
            cross: outcome.parameters[0],
            slope: outcome.parameters[1],
            curvature: outcome.parameters[2],
        }
    }

    pub fn evaluate(&self, displacement: f64) -> f64 {
        self.curvature
            .mul_add(displacement, self.slope)
            .mul_add(displacement, self.cross)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameterization {
    Rational,
    Quadratic,
}

/// `position = S (Ip - R Im + P) / (Ip + R Im + Q)` around `reference`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RationalCoefficients {
    pub p: f64,
    pub q: f64,
    pub r: f64,
    pub s: f64,
    pub reference: f64,
}

/// One channel polynomial `G + F u + E u^2`, normalised to the plus channel's response at
/// the reference.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelForm {
    pub e: f64,
    pub f: f64,
    pub g: f64,
}

/// Normalised plus and minus polynomials around `reference`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuadraticCoefficients {
    pub plus: ChannelForm,
    pub minus: ChannelForm,
    pub reference: f64,
}

impl QuadraticCoefficients {
    /// Coefficients `(A, B, C)` of the position equation for a measured pair.
    pub fn equation(&self, plus: f64, minus: f64) -> (f64, f64, f64) {
        (
            plus.mul_add(self.minus.e, -minus * self.plus.e),
            plus.mul_add(self.minus.f, -minus * self.plus.f),
            plus.mul_add(self.minus.g, -minus * self.plus.g),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum Coefficients {
    Rational(RationalCoefficients),
    Quadratic(QuadraticCoefficients),
}

impl Coefficients {
    pub const fn parameterization(&self) -> Parameterization {
        match self {
            Self::Rational(_) => Parameterization::Rational,
            Self::Quadratic(_) => Parameterization::Quadratic,
        }
    }

    /// Position the coefficients were derived around.
    pub const fn reference(&self) -> f64 {
        match self {
            Self::Rational(coefficients) => coefficients.reference,
            Self::Quadratic(coefficients) => coefficients.reference,
        }
    }
}

/// Everything derived from one plus/minus profile pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationFit {
    pub plus: ChannelResponse,
    pub minus: ChannelResponse,
    pub rational: RationalCoefficients,
    pub quadratic: QuadraticCoefficients,
}

impl CalibrationFit {
    pub const fn coefficients(&self, parameterization: Parameterization) -> Coefficients {
        match parameterization {
            Parameterization::Rational => Coefficients::Rational(self.rational),
            Parameterization::Quadratic => Coefficients::Quadratic(self.quadratic),
        }
    }
}

pub struct CalibrationFitter<F> {
    service: F,
    /// Responses closer to zero than this cannot be divided by
    tolerance: f64,
}

impl<F: FitService> CalibrationFitter<F> {
    pub const DEFAULT_TOLERANCE: f64 = 1e-12;

    pub const fn new(service: F) -> Self {
        Self {
            service,
            tolerance: Self::DEFAULT_TOLERANCE,
        }
    }

    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Fit the `plus` and `minus` profiles of one sensor axis around `reference`.
    ///
    /// `scale` is the sensor axis constant `S` of the rational form.
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if the profiles lie along different axes
    /// - [`Error::InsufficientData`] if either profile has fewer than three weighted bins
    /// - [`Error::DegenerateCalibration`] if the plus response at the reference or the minus
    ///   slope vanish
    /// - any error of the fit itself
    pub fn fit(
        &self,
        plus: &ResponseProfile,
        minus: &ResponseProfile,
        reference: f64,
        scale: f64,
    ) -> Result<CalibrationFit> {
        if plus.axis() != minus.axis() {
            return Err(Error::InvalidConfig(format!(
                "plus profile along {:?} cannot pair with minus profile along {:?}",
                plus.axis(),
                minus.axis()
            )));
        }
        let plus = self.fit_channel(plus, reference)?;
        let minus = self.fit_channel(minus, reference)?;

        if plus.cross.abs() <= self.tolerance {
            return Err(Error::DegenerateCalibration(format!(
                "plus response at the reference is {}",
                plus.cross
            )));
        }
        if minus.slope.abs() <= self.tolerance {
            return Err(Error::DegenerateCalibration(format!(
                "minus slope is {}",
                minus.slope
            )));
        }

        let r = -plus.slope / minus.slope;
        let rational = RationalCoefficients {
            p: r.mul_add(minus.cross, -plus.cross),
            q: (2.0 * scale).mul_add(plus.slope, -plus.cross) - r * minus.cross,
            r,
            s: scale,
            reference,
        };
        let quadratic = QuadraticCoefficients {
            plus: ChannelForm {
                e: plus.curvature / plus.cross,
                f: plus.slope / plus.cross,
                g: 1.0,
            },
            minus: ChannelForm {
                e: minus.curvature / plus.cross,
                f: minus.slope / plus.cross,
                g: minus.cross / plus.cross,
            },
            reference,
        };
        info!(
            "calibrated around {reference}: P = {}, Q = {}, R = {}, S = {scale}",
            rational.p, rational.q, rational.r
        );

        Ok(CalibrationFit {
            plus,
            minus,
            rational,
            quadratic,
        })
    }

    fn fit_channel(&self, profile: &ResponseProfile, reference: f64) -> Result<ChannelResponse> {
        let usable = profile.weighted_bins();
        if usable < MIN_USABLE_BINS {
            return Err(Error::InsufficientData(format!(
                "profile has {usable} usable bins, a calibration needs {MIN_USABLE_BINS}"
            )));
        }
        let outcome = self
            .service
            .fit(&profile.shifted(reference), Model::Quadratic)?;
        Ok(ChannelResponse::from_outcome(&outcome))
    }
}
