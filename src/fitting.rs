use argmin::core::Jacobian;
use ndarray::Array1;
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::histogram::ResponseProfile;
use crate::minimisation::SinusoidProblem;
use crate::polyfit::polyfit;
use crate::Result;

/// Functional forms a profile can be fitted with.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Linear,
    Quadratic,
    Cubic,
    /// `p0 + p1 sin(2 pi p2 t + p3)`, started from `frequency`
    Sinusoid { frequency: f64 },
}

impl Model {
    pub const fn num_parameters(self) -> usize {
        match self {
            Self::Linear => 2,
            Self::Quadratic => 3,
            Self::Cubic | Self::Sinusoid { .. } => 4,
        }
    }
}

/// Best-fit parameters of a [`Model`].
///
/// Polynomial parameters are in increasing power order.
#[derive(Clone, Debug, PartialEq)]
pub struct FitOutcome {
    pub parameters: Array1<f64>,
    pub uncertainties: Array1<f64>,
    /// `None` when the fit used as many points as parameters
    pub reduced_chi_square: Option<f64>,
}

impl FitOutcome {
    /// Evaluate a polynomial outcome at `x`.
    pub fn evaluate_polynomial(&self, x: f64) -> f64 {
        self.parameters
            .iter()
            .rev()
            .fold(0.0, |acc, coeff| acc.mul_add(x, *coeff))
    }
}

pub trait FitService {
    /// Fit the bins of `profile` with `model`.
    ///
    /// # Errors
    /// Implementations fail if the profile has too few usable bins or the fit cannot be
    /// solved.
    fn fit(&self, profile: &ResponseProfile, model: Model) -> Result<FitOutcome>;
}

/// Inverse-variance weighted least squares.
///
/// Suppressed and empty bins carry no weight and drop out of the fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeastSquares {
    /// Attach a terminal observer to non-linear fits
    pub log_iterations: bool,
}

impl FitService for LeastSquares {
    fn fit(&self, profile: &ResponseProfile, model: Model) -> Result<FitOutcome> {
        let x = profile.grid().centers().to_vec();
        let y = profile.content().to_vec();
        let weights = profile.bins().map(|bin| bin.weight()).collect::<Vec<_>>();

        let outcome = match model {
            Model::Linear | Model::Quadratic | Model::Cubic => {
                let fit = polyfit(&x, &y, model.num_parameters() - 1, &weights)?;
                FitOutcome {
                    parameters: fit.solution().clone(),
                    uncertainties: fit.uncertainties(),
                    reduced_chi_square: fit.reduced_chi_square(),
                }
            }
            Model::Sinusoid { frequency } => self.fit_sinusoid(&x, &y, &weights, frequency)?,
        };
        debug!(
            "fitted {model:?} along {:?}: {} (reduced chi square {:?})",
            profile.axis(),
            outcome.parameters,
            outcome.reduced_chi_square
        );
        Ok(outcome)
    }
}

impl LeastSquares {
    #[allow(clippy::cast_precision_loss)]
    fn fit_sinusoid(&self, t: &[f64], y: &[f64], weights: &[f64], frequency: f64) -> Result<FitOutcome> {
        let problem = SinusoidProblem::new(t, y, weights);
        let num_parameters = Model::Sinusoid { frequency }.num_parameters();
        if problem.len() < num_parameters {
            return Err(Error::InsufficientData(format!(
                "a sinusoid fit needs {num_parameters} weighted points, got {}",
                problem.len()
            )));
        }

        let initial = problem.initial_parameters(frequency)?;
        let parameters = problem.clone().solve(initial, self.log_iterations)?;

        let jacobian = problem.jacobian(&parameters)?;
        let covariance = jacobian.t().dot(&jacobian).inv()?;
        let degrees_of_freedom = problem.len() - num_parameters;

        Ok(FitOutcome {
            uncertainties: covariance.diag().mapv(f64::sqrt),
            reduced_chi_square: (degrees_of_freedom > 0)
                .then(|| problem.chi_square(&parameters) / degrees_of_freedom as f64),
            parameters,
        })
    }
}
