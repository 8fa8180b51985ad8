use std::f64::consts::TAU;

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{Executor, Jacobian, Operator};
use argmin::solver::gaussnewton::GaussNewtonLS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use ndarray::{s, Array1, Array2};
use ndarray_linalg::LeastSquaresSvd;

use crate::error::Error;
use crate::Result;

/// Weighted least-squares fit of `p0 + p1 sin(2 pi p2 t + p3)`.
///
/// The residual vector is `sqrt(w_i) (f(t_i) - y_i)`, so minimising its norm is the
/// inverse-variance weighted fit.
#[derive(Clone)]
pub(crate) struct SinusoidProblem {
    t: Array1<f64>,
    y: Array1<f64>,
    /// Square roots of the weights
    scale: Array1<f64>,
}

impl SinusoidProblem {
    /// Points with a zero or non-finite weight are dropped.
    pub(crate) fn new(t: &[f64], y: &[f64], weights: &[f64]) -> Self {
        let (mut ts, mut ys, mut scale) = (vec![], vec![], vec![]);
        for ((&ti, &yi), &wi) in t.iter().zip(y).zip(weights) {
            if wi > 0.0 && wi.is_finite() {
                ts.push(ti);
                ys.push(yi);
                scale.push(wi.sqrt());
            }
        }
        Self {
            t: Array1::from(ts),
            y: Array1::from(ys),
            scale: Array1::from(scale),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.t.len()
    }

    fn phase(params: &Array1<f64>, t: f64) -> f64 {
        (TAU * params[2]).mul_add(t, params[3])
    }

    fn compute(&self, params: &Array1<f64>) -> Array1<f64> {
        self.t
            .mapv(|t| params[1].mul_add(Self::phase(params, t).sin(), params[0]))
    }

    /// Chi square of `params`.
    pub(crate) fn chi_square(&self, params: &Array1<f64>) -> f64 {
        ((self.compute(params) - &self.y) * &self.scale)
            .mapv(|r| r * r)
            .sum()
    }

    /// Starting parameters for a sinusoid of `frequency`.
    ///
    /// With the frequency held fixed the model is linear in `a + b sin + c cos`, which a
    /// single least-squares solve gives us; amplitude and phase follow from `b` and `c`.
    pub(crate) fn initial_parameters(&self, frequency: f64) -> Result<Array1<f64>> {
        let mut design = Array2::zeros((self.len(), 3));
        for (ii, (&t, &scale)) in self.t.iter().zip(&self.scale).enumerate() {
            let phase = TAU * frequency * t;
            design[[ii, 0]] = scale;
            design[[ii, 1]] = scale * phase.sin();
            design[[ii, 2]] = scale * phase.cos();
        }
        let rhs = &self.y * &self.scale;
        let linear = design.least_squares(&rhs)?.solution;
        Ok(Array1::from(vec![
            linear[0],
            linear[1].hypot(linear[2]),
            frequency,
            linear[2].atan2(linear[1]),
        ]))
    }

    /// Run the optimisation
    pub(crate) fn solve(self, initial_parameters: Array1<f64>, log_iterations: bool) -> Result<Array1<f64>> {
        let linesearch = MoreThuenteLineSearch::new().with_bounds(0.0, 1.0)?;

        let solver = GaussNewtonLS::new(linesearch).with_tolerance(f64::EPSILON.sqrt())?;

        let executor = Executor::new(self, solver)
            .configure(|state| state.param(initial_parameters).max_iters(100));
        let executor = if log_iterations {
            executor.add_observer(SlogLogger::term(), ObserverMode::Always)
        } else {
            executor
        };
        let res = executor.run()?;

        let mut state = res.state().clone();
        state
            .take_param()
            .ok_or_else(|| Error::InsufficientData("minimisation produced no parameters".into()))
    }
}

impl Operator for SinusoidProblem {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok((self.compute(p) - &self.y) * &self.scale)
    }
}

impl Jacobian for SinusoidProblem {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let mut jacobian = Array2::zeros((self.len(), 4));
        for (ii, (&t, &scale)) in self.t.iter().zip(&self.scale).enumerate() {
            let phase = Self::phase(p, t);
            let (sin, cos) = phase.sin_cos();
            jacobian
                .slice_mut(s![ii, ..])
                .assign(&(Array1::from(vec![1.0, sin, p[1] * cos * TAU * t, p[1] * cos]) * scale));
        }
        Ok(jacobian)
    }
}
