use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::calibration::{Coefficients, QuadraticCoefficients, RationalCoefficients};
use crate::error::Error;
use crate::Result;

/// Shown in place of a position when there is no estimate.
pub const NO_ESTIMATE: &str = "***";

/// The `(-b - sqrt(b^2 - 4ac)) / 2a` root of `a x^2 + b x + c`.
///
/// `None` when `a` is zero or the roots are complex.
pub fn solve_quadratic<T: Float>(a: T, b: T, c: T) -> Option<T> {
    let two = T::one() + T::one();
    let discriminant = b.powi(2) - two * two * a * c;
    if a.is_zero() || discriminant < T::zero() {
        return None;
    }
    Some((-b - discriminant.sqrt()) / (two * a))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Plus and minus currents summing to this or less are not solved
    pub min_combined_signal: f64,
    /// Added to the rational denominator
    pub epsilon: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            min_combined_signal: 100.0,
            epsilon: 1e-99,
        }
    }
}

impl SolverConfig {
    /// Displacement from the calibration reference for pedestal-subtracted `plus` and
    /// `minus` currents.
    ///
    /// # Errors
    /// [`Error::NoSolution`] or [`Error::InsufficientSignal`]; see [`Self::rational`] and
    /// [`Self::quadratic`].
    pub fn displacement(&self, coefficients: &Coefficients, plus: f64, minus: f64) -> Result<f64> {
        match coefficients {
            Coefficients::Rational(rational) => self.rational(rational, plus, minus),
            Coefficients::Quadratic(quadratic) => self.quadratic(quadratic, plus, minus),
        }
    }

    /// Absolute position, the reference plus the displacement.
    ///
    /// # Errors
    /// As [`Self::displacement`].
    pub fn position(&self, coefficients: &Coefficients, plus: f64, minus: f64) -> Result<f64> {
        Ok(coefficients.reference() + self.displacement(coefficients, plus, minus)?)
    }

    /// # Errors
    /// [`Error::NoSolution`] if the result is not finite.
    pub fn rational(&self, coefficients: &RationalCoefficients, plus: f64, minus: f64) -> Result<f64> {
        let RationalCoefficients { p, q, r, s, .. } = *coefficients;
        let numerator = r.mul_add(-minus, plus) + p;
        let denominator = r.mul_add(minus, plus) + q + self.epsilon;
        let displacement = s * numerator / denominator;
        if displacement.is_finite() {
            Ok(displacement)
        } else {
            Err(Error::NoSolution)
        }
    }

    /// # Errors
    /// - [`Error::InsufficientSignal`] if `plus + minus` does not exceed the threshold
    /// - [`Error::NoSolution`] if the position equation has no real root
    pub fn quadratic(&self, coefficients: &QuadraticCoefficients, plus: f64, minus: f64) -> Result<f64> {
        let combined = plus + minus;
        if combined <= self.min_combined_signal {
            return Err(Error::InsufficientSignal {
                combined,
                threshold: self.min_combined_signal,
            });
        }
        let (a, b, c) = coefficients.equation(plus, minus);
        solve_quadratic(a, b, c).ok_or(Error::NoSolution)
    }
}

/// Text for a solved position, with [`NO_ESTIMATE`] standing in for expected failures.
///
/// Errors other than "no estimate" are rendered as their message.
pub fn display_estimate(estimate: &Result<f64>) -> String {
    match estimate {
        Ok(position) => format!("{position:.3}"),
        Err(e) if e.is_no_estimate() => NO_ESTIMATE.to_owned(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{display_estimate, solve_quadratic, SolverConfig, NO_ESTIMATE};
    use crate::calibration::{ChannelForm, Coefficients, QuadraticCoefficients, RationalCoefficients};
    use crate::error::Error;

    fn rational() -> RationalCoefficients {
        RationalCoefficients {
            p: 595.0,
            q: -1457.0,
            r: 1.34,
            s: 6.3,
            reference: 0.0,
        }
    }

    fn quadratic() -> QuadraticCoefficients {
        QuadraticCoefficients {
            plus: ChannelForm {
                e: 0.002,
                f: 0.08,
                g: 1.0,
            },
            minus: ChannelForm {
                e: 0.0015,
                f: -0.07,
                g: 0.9,
            },
            reference: 10.0,
        }
    }

    #[test]
    fn rational_form_matches_the_worked_value() {
        let solved = SolverConfig::default().rational(&rational(), 500.0, 300.0).unwrap();
        approx::assert_relative_eq!(solved, -7.866_486_486_486_487, epsilon = 1e-6);
    }

    #[test]
    fn complex_roots_have_no_solution() {
        assert_eq!(solve_quadratic(1.0, 0.0, 1.0), None);
        assert_eq!(solve_quadratic(0.0, 2.0, 1.0), None);
        assert_eq!(solve_quadratic(1.0f32, 0.0, -4.0), Some(-2.0));
    }

    #[test]
    fn quadratic_form_picks_the_physical_root() {
        let solver = SolverConfig::default();
        let displacement = solver.quadratic(&quadratic(), 1040.5, 865.375).unwrap();
        approx::assert_relative_eq!(displacement, 0.5, epsilon = 1e-9);

        let position = solver
            .position(&Coefficients::Quadratic(quadratic()), 1040.5, 865.375)
            .unwrap();
        approx::assert_relative_eq!(position, 10.5, epsilon = 1e-9);
    }

    #[test]
    fn weak_signal_is_checked_before_solving() {
        let result = SolverConfig::default().quadratic(&quadratic(), 60.0, 40.0);
        assert!(matches!(
            result,
            Err(Error::InsufficientSignal { combined, .. }) if (combined - 100.0).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn vanishing_denominator_has_no_solution() {
        let coefficients = RationalCoefficients {
            p: 0.0,
            q: 0.0,
            r: 1.0,
            s: 1.0,
            reference: 0.0,
        };
        let solver = SolverConfig {
            epsilon: 0.0,
            ..SolverConfig::default()
        };
        assert!(matches!(
            solver.rational(&coefficients, 0.0, 0.0),
            Err(Error::NoSolution)
        ));
    }

    #[test]
    fn no_estimates_display_as_sentinel() {
        assert_eq!(display_estimate(&Err(Error::NoSolution)), NO_ESTIMATE);
        assert_eq!(
            display_estimate(&Err(Error::InsufficientSignal {
                combined: 3.0,
                threshold: 100.0
            })),
            NO_ESTIMATE
        );
        assert_eq!(display_estimate(&Ok(-7.8664)), "-7.866");
        assert_ne!(
            display_estimate(&Err(Error::UnknownScan("scan".into()))),
            NO_ESTIMATE
        );
    }

    proptest! {
        #[test]
        fn smaller_root_is_returned_for_positive_leading_coefficient(
            a in 0.1f64..10.0,
            root in -10.0f64..10.0,
            gap in 0.5f64..10.0,
        ) {
            let other = root + gap;
            let (b, c) = (-a * (root + other), a * root * other);
            let solved = solve_quadratic(a, b, c).unwrap();
            prop_assert!((solved - root).abs() < 1e-6);
        }
    }
}
