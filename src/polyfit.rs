use ndarray::{Array, Array1, Array2};
use ndarray_linalg::{Inverse, LeastSquaresSvd};

use crate::error::Error;
use crate::Result;

/// Weighted least-squares polynomial fit.
#[derive(Clone, Debug, PartialEq)]
pub struct FitResult {
    /// Coefficients in increasing power order
    solution: Array1<f64>,
    covariance: Array2<f64>,
    chi_square: f64,
    degrees_of_freedom: usize,
}

impl FitResult {
    pub const fn solution(&self) -> &Array1<f64> {
        &self.solution
    }

    pub const fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn uncertainties(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }

    /// `None` when the fit has no degrees of freedom left.
    #[allow(clippy::cast_precision_loss)]
    pub fn reduced_chi_square(&self) -> Option<f64> {
        (self.degrees_of_freedom > 0).then(|| self.chi_square / self.degrees_of_freedom as f64)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.solution
            .iter()
            .rev()
            .fold(0.0, |acc, coeff| acc.mul_add(x, *coeff))
    }
}

/// The Vandermonde matrix of `degree` for observations `x`, each row scaled by `scale`.
///
/// Row `i` is `scale[i] * [1, x_i, x_i^2, ..., x_i^degree]`.
fn scaled_vandermonde(x: &[f64], scale: &[f64], degree: usize) -> Result<Array2<f64>> {
    let vals = x.iter().zip(scale).flat_map(|(xi, si)| {
        (0..=degree).scan(*si, move |term, _| {
            let current = *term;
            *term *= xi;
            Some(current)
        })
    });

    Ok(Array::from_iter(vals).into_shape((x.len(), degree + 1))?)
}

/// Fit `y(x)` with a polynomial of `degree`, weighting each point by `weights`.
///
/// Weights are inverse variances; points with a zero or non-finite weight do not take part
/// in the fit.
///
/// # Errors
/// Returns [`Error::InsufficientData`] when fewer than `degree + 1` points have a usable
/// weight, or a linear algebra error for a singular system.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize, weights: &[f64]) -> Result<FitResult> {
    let (mut xs, mut ys, mut scale) = (vec![], vec![], vec![]);
    for ((&xi, &yi), &wi) in x.iter().zip(y).zip(weights) {
        if wi > 0.0 && wi.is_finite() && xi.is_finite() && yi.is_finite() {
            xs.push(xi);
            ys.push(yi * wi.sqrt());
            scale.push(wi.sqrt());
        }
    }
    if xs.len() < degree + 1 {
        return Err(Error::InsufficientData(format!(
            "a degree {degree} fit needs {} weighted points, got {}",
            degree + 1,
            xs.len()
        )));
    }

    let design = scaled_vandermonde(&xs, &scale, degree)?;
    let rhs = Array1::from(ys);
    let solution = design.least_squares(&rhs)?.solution;
    let covariance = design.t().dot(&design).inv()?;

    let residuals = &rhs - &design.dot(&solution);
    let chi_square = residuals.mapv(|r| r * r).sum();

    Ok(FitResult {
        solution,
        covariance,
        chi_square,
        degrees_of_freedom: xs.len() - (degree + 1),
    })
}
