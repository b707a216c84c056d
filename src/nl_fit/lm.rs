use crate::nl_fit::bounds::{clamp_to_bounds, within_bounds};
use crate::nl_fit::curve_fit::{CurveFitResult, CurveFitTrait, LeastSquaresProblem};

use nalgebra::{DMatrix, DVector};

/// Levenberg–Marquardt least-squares optimizer with box constraints
///
/// Every trial step is projected onto the bounds before it is evaluated, so the optimizer never
/// leaves the feasible region. The damping term is scaled by the diagonal of $J^T J$, which makes
/// the iterations invariant to parameter units.
///
/// The fit is successful when the relative decrease of $\chi^2$ or the relative step falls below
/// the tolerances, or when no damped step improves $\chi^2$ anymore. Reaching `max_iterations`
/// accepted steps is reported as a failure, so does a zero `max_iterations`.
#[derive(Clone, Debug, PartialEq)]
pub struct LmCurveFit {
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
}

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_FACTOR: f64 = 10.0;
const LAMBDA_MAX: f64 = 1e10;

impl LmCurveFit {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ftol: Self::default_ftol(),
            xtol: Self::default_xtol(),
        }
    }

    #[inline]
    pub fn default_max_iterations() -> usize {
        100
    }

    #[inline]
    pub fn default_ftol() -> f64 {
        1e-10
    }

    #[inline]
    pub fn default_xtol() -> f64 {
        1e-10
    }
}

impl Default for LmCurveFit {
    fn default() -> Self {
        Self::new(Self::default_max_iterations())
    }
}

impl CurveFitTrait for LmCurveFit {
    fn curve_fit<P: LeastSquaresProblem>(
        &self,
        problem: &P,
        x0: &[f64],
        bounds: (&[f64], &[f64]),
    ) -> CurveFitResult {
        let (lower, upper) = bounds;
        let nparams = x0.len();
        let ndata = problem.ndata();

        let mut x = x0.to_vec();
        clamp_to_bounds(&mut x, lower, upper);

        let mut residuals = DVector::zeros(ndata);
        let mut jacobian = DMatrix::zeros(ndata, nparams);
        problem.residuals_jacobian(&x, &mut residuals, &mut jacobian);
        let mut chi2 = residuals.norm_squared();

        let failure = |x: Vec<f64>, chi2: f64, iterations: usize| CurveFitResult {
            x,
            chi2,
            iterations,
            success: false,
        };
        if !chi2.is_finite() || ndata < nparams {
            return failure(x, chi2, 0);
        }

        let mut trial_residuals = DVector::zeros(ndata);
        let mut lambda = LAMBDA_INIT;
        for iteration in 1..=self.max_iterations {
            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let minus_grad = -(&jt * &residuals);

            let (trial, trial_chi2) = loop {
                let mut h = jtj.clone();
                for i in 0..nparams {
                    h[(i, i)] += lambda * jtj[(i, i)].max(f64::EPSILON);
                }
                let step = h.cholesky().map(|ch| ch.solve(&minus_grad));
                if let Some(step) = step {
                    let mut trial: Vec<_> = x.iter().zip(step.iter()).map(|(a, b)| a + b).collect();
                    clamp_to_bounds(&mut trial, lower, upper);
                    problem.residuals(&trial, &mut trial_residuals);
                    let trial_chi2 = trial_residuals.norm_squared();
                    if trial_chi2.is_finite() && trial_chi2 <= chi2 {
                        lambda = (lambda / LAMBDA_FACTOR).max(f64::EPSILON);
                        break (trial, trial_chi2);
                    }
                }
                lambda *= LAMBDA_FACTOR;
                if lambda > LAMBDA_MAX {
                    // No damped step improves the objective: we are at a minimum
                    debug_assert!(within_bounds(&x, lower, upper));
                    return CurveFitResult {
                        x,
                        chi2,
                        iterations: iteration - 1,
                        success: true,
                    };
                }
            };

            let step_norm = x
                .iter()
                .zip(trial.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            let x_norm = trial.iter().map(|a| a * a).sum::<f64>().sqrt();
            let converged = chi2 - trial_chi2 <= self.ftol * chi2
                || step_norm <= self.xtol * (x_norm + self.xtol);

            x = trial;
            chi2 = trial_chi2;
            if converged {
                return CurveFitResult {
                    x,
                    chi2,
                    iterations: iteration,
                    success: true,
                };
            }
            problem.residuals_jacobian(&x, &mut residuals, &mut jacobian);
        }
        failure(x, chi2, self.max_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use rand::prelude::*;
    use rand_distr::StandardNormal;

    /// y = a exp(-b t)
    struct Exponent {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquaresProblem for Exponent {
        fn ndata(&self) -> usize {
            self.t.len()
        }

        fn residuals(&self, x: &[f64], residuals: &mut DVector<f64>) {
            for (r, (t, y)) in residuals.iter_mut().zip(self.t.iter().zip(self.y.iter())) {
                *r = y - x[0] * f64::exp(-x[1] * t);
            }
        }

        fn residuals_jacobian(
            &self,
            x: &[f64],
            residuals: &mut DVector<f64>,
            jacobian: &mut DMatrix<f64>,
        ) {
            self.residuals(x, residuals);
            for (i, t) in self.t.iter().enumerate() {
                let e = f64::exp(-x[1] * t);
                jacobian[(i, 0)] = -e;
                jacobian[(i, 1)] = x[0] * t * e;
            }
        }
    }

    fn exponent(a: f64, b: f64, noise: f64) -> Exponent {
        let mut rng = StdRng::seed_from_u64(0);
        let t: Vec<_> = (0..50).map(|i| 0.1 * i as f64).collect();
        let y = t
            .iter()
            .map(|t| a * f64::exp(-b * t) + noise * rng.sample::<f64, _>(StandardNormal))
            .collect();
        Exponent { t, y }
    }

    #[test]
    fn exact_data() {
        let problem = exponent(3.0, 0.7, 0.0);
        let result = LmCurveFit::default().curve_fit(
            &problem,
            &[1.0, 0.1],
            (&[0.0, 0.0], &[f64::INFINITY, f64::INFINITY]),
        );
        assert!(result.success);
        assert_relative_eq!(result.x[0], 3.0, max_relative = 1e-6);
        assert_relative_eq!(result.x[1], 0.7, max_relative = 1e-6);
        assert!(result.chi2 < 1e-12);
    }

    #[test]
    fn noisy_data() {
        let problem = exponent(3.0, 0.7, 0.01);
        let result = LmCurveFit::default().curve_fit(
            &problem,
            &[1.0, 0.1],
            (&[0.0, 0.0], &[f64::INFINITY, f64::INFINITY]),
        );
        assert!(result.success);
        assert_relative_eq!(result.x[0], 3.0, max_relative = 1e-2);
        assert_relative_eq!(result.x[1], 0.7, max_relative = 1e-2);
    }

    #[test]
    fn active_bound() {
        let problem = exponent(3.0, 0.7, 0.0);
        let result = LmCurveFit::default().curve_fit(
            &problem,
            &[1.0, 0.1],
            (&[0.0, 0.0], &[2.0, f64::INFINITY]),
        );
        assert!(result.success);
        assert_eq!(result.x[0], 2.0);
    }

    #[test]
    fn iteration_cap() {
        let problem = exponent(3.0, 0.7, 0.0);
        let result = LmCurveFit::new(1).curve_fit(
            &problem,
            &[1.0, 0.1],
            (&[0.0, 0.0], &[f64::INFINITY, f64::INFINITY]),
        );
        assert!(!result.success);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn zero_iterations() {
        let problem = exponent(3.0, 0.7, 0.0);
        let result = LmCurveFit::new(0).curve_fit(
            &problem,
            &[1.0, 0.1],
            (&[0.0, 0.0], &[f64::INFINITY, f64::INFINITY]),
        );
        assert!(!result.success);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.x, vec![1.0, 0.1]);
    }
}
