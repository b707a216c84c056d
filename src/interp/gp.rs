use crate::error::InterpError;
use crate::interp::{FittedInterp, FittedStateTrait, InterpolatorTrait, validate};
use crate::types::Position;

use itertools::Itertools;
use macro_const::macro_const;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_const! {
    const DOC: &str = r"
Gaussian-process (kriging) interpolator with squared-exponential kernel

All parameters share the correlation function
$$
R(x, x') = \exp\left(-\frac{|x - x'|^2}{2\ell^2}\right) + \eta\,\delta_{xx'},
$$
each parameter has its own constant mean and amplitude, the amplitude is the maximum-likelihood
estimate for the given length scale $\ell$ and relative white noise $\eta$. Whichever of $\ell$
and $\eta$ is not specified is found by a grid search over the log marginal likelihood summed
over parameters, so noisy training values are smoothed rather than reproduced.

Predictions come with a variance
$$
\sigma^2_j(x) = a_j \left(1 + \eta - r^T R^{-1} r\right),
$$
which vanishes at training positions when the white-noise term $\eta$ is zero.
";
}

/// Diagonal jitter relative to unit kernel amplitude
const JITTER: f64 = 1e-10;
/// Length scale grid in units of the training-set diameter
const GRID_MIN_LOG10: f64 = -2.0;
const GRID_MAX_LOG10: f64 = 0.5;
const GRID_SIZE: usize = 26;
/// White-noise grid, relative to the kernel amplitude
const NOISE_GRID_MIN_LOG10: f64 = -8.0;
const NOISE_GRID_MAX_LOG10: f64 = 0.0;
const NOISE_GRID_SIZE: usize = 17;

#[doc = DOC!()]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GaussianProcess {
    /// Correlation length in field units, found from the data if not given
    #[serde(default)]
    length_scale: Option<f64>,
    /// Relative white-noise variance $\eta$, found from the data if not given
    #[serde(default)]
    white_noise: Option<f64>,
}

impl GaussianProcess {
    /// Panics if `length_scale` is not positive or `white_noise` is negative
    pub fn new(length_scale: Option<f64>, white_noise: Option<f64>) -> Self {
        let gp = Self {
            length_scale,
            white_noise,
        };
        if let Err(message) = gp.validate() {
            panic!("{message}");
        }
        gp
    }

    pub fn length_scale(&self) -> Option<f64> {
        self.length_scale
    }

    pub fn white_noise(&self) -> Option<f64> {
        self.white_noise
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if let Some(length_scale) = self.length_scale {
            if !(length_scale.is_finite() && length_scale > 0.0) {
                return Err(format!(
                    "Gaussian process length_scale must be positive, {length_scale} given"
                ));
            }
        }
        if let Some(white_noise) = self.white_noise {
            if !(white_noise.is_finite() && white_noise >= 0.0) {
                return Err(format!(
                    "Gaussian process white_noise must be non-negative, {white_noise} given"
                ));
            }
        }
        Ok(())
    }

    pub fn doc() -> &'static str {
        DOC
    }

    fn correlation(positions: &[Position], length_scale: f64, white_noise: f64) -> DMatrix<f64> {
        let n = positions.len();
        let nugget = white_noise + JITTER;
        DMatrix::from_fn(n, n, |i, k| {
            let r = kernel(positions[i], positions[k], length_scale);
            if i == k { r + nugget } else { r }
        })
    }

    /// Cholesky factor, centered values and per-parameter ML amplitudes
    fn condition(
        positions: &[Position],
        y: &DMatrix<f64>,
        length_scale: f64,
        white_noise: f64,
    ) -> Option<Conditioned> {
        let cholesky = Self::correlation(positions, length_scale, white_noise).cholesky()?;
        let alpha = cholesky.solve(y);
        let n = positions.len() as f64;
        let amplitude = y
            .column_iter()
            .zip(alpha.column_iter())
            .map(|(y, alpha)| (y.dot(&alpha) / n).max(f64::MIN_POSITIVE))
            .collect_vec();
        let ln_det = 2.0 * cholesky.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>();
        // Profile log-likelihood, amplitudes replaced by their ML estimates
        let lml = amplitude
            .iter()
            .map(|a| -0.5 * (n * a.ln() + ln_det + n))
            .sum::<f64>();
        Some(Conditioned {
            cholesky,
            alpha,
            amplitude,
            lml,
        })
    }
}

impl Default for GaussianProcess {
    fn default() -> Self {
        Self::new(None, None)
    }
}

struct Conditioned {
    cholesky: Cholesky<f64, Dyn>,
    alpha: DMatrix<f64>,
    amplitude: Vec<f64>,
    lml: f64,
}

#[inline]
fn kernel(a: Position, b: Position, length_scale: f64) -> f64 {
    let d_sq = (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2);
    f64::exp(-0.5 * d_sq / (length_scale * length_scale))
}

/// Logarithmically spaced grid
fn log_grid(min_log10: f64, max_log10: f64, size: usize) -> impl Iterator<Item = f64> {
    (0..size).map(move |i| {
        10f64.powf(min_log10 + (max_log10 - min_log10) * i as f64 / (size - 1) as f64)
    })
}

impl InterpolatorTrait for GaussianProcess {
    fn train(
        &self,
        positions: &[Position],
        params: &[Vec<f64>],
    ) -> Result<FittedInterp, InterpError> {
        let nparams = validate(self, positions, params)?;
        let n = positions.len();
        let mean = (0..nparams)
            .map(|j| params.iter().map(|p| p[j]).sum::<f64>() / n as f64)
            .collect_vec();
        let y = DMatrix::from_fn(n, nparams, |i, j| params[i][j] - mean[j]);

        let length_scales = match self.length_scale {
            Some(length_scale) => vec![length_scale],
            None => {
                let diameter = positions
                    .iter()
                    .tuple_combinations()
                    .map(|(a, b)| (a[0] - b[0]).hypot(a[1] - b[1]))
                    .fold(0.0, f64::max);
                if diameter == 0.0 {
                    return Err(InterpError::Singular);
                }
                log_grid(GRID_MIN_LOG10, GRID_MAX_LOG10, GRID_SIZE)
                    .map(|x| diameter * x)
                    .collect()
            }
        };
        let white_noises = match self.white_noise {
            Some(white_noise) => vec![white_noise],
            None => log_grid(NOISE_GRID_MIN_LOG10, NOISE_GRID_MAX_LOG10, NOISE_GRID_SIZE).collect(),
        };
        let (length_scale, white_noise, conditioned) = length_scales
            .iter()
            .cartesian_product(white_noises.iter())
            .filter_map(|(&ell, &eta)| {
                Self::condition(positions, &y, ell, eta).map(|c| (ell, eta, c))
            })
            .filter(|(_, _, c)| c.lml.is_finite())
            .max_by(|(_, _, a), (_, _, b)| a.lml.total_cmp(&b.lml))
            .ok_or(InterpError::Singular)?;
        log::debug!(
            "Gaussian process trained on {n} points, length scale {length_scale}, white noise {white_noise}, log-likelihood {}",
            conditioned.lml
        );

        let state = GaussianProcessState {
            positions: positions.to_vec(),
            length_scale,
            white_noise,
            mean,
            amplitude: conditioned.amplitude,
            alpha: Array2::from_shape_fn((n, nparams), |(i, j)| conditioned.alpha[(i, j)]),
            chol: Array2::from_shape_fn((n, n), |(i, k)| {
                if k <= i {
                    conditioned.cholesky.l_dirty()[(i, k)]
                } else {
                    0.0
                }
            }),
        };
        Ok(FittedInterp::new(state.into(), positions))
    }
}

/// Trained [GaussianProcess]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussianProcessState {
    positions: Vec<Position>,
    length_scale: f64,
    white_noise: f64,
    mean: Vec<f64>,
    amplitude: Vec<f64>,
    /// $R^{-1} (y - \mathrm{mean})$, one column per parameter
    alpha: Array2<f64>,
    /// Lower Cholesky factor of $R$
    chol: Array2<f64>,
}

impl GaussianProcessState {
    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    pub fn white_noise(&self) -> f64 {
        self.white_noise
    }

    /// Solve $L z = r$ by forward substitution
    fn forward_substitution(&self, r: &[f64]) -> Vec<f64> {
        let n = r.len();
        let mut z = vec![0.0; n];
        for i in 0..n {
            let s: f64 = (0..i).map(|k| self.chol[(i, k)] * z[k]).sum();
            z[i] = (r[i] - s) / self.chol[(i, i)];
        }
        z
    }
}

impl FittedStateTrait for GaussianProcessState {
    fn nparams(&self) -> usize {
        self.mean.len()
    }

    fn evaluate(&self, position: Position) -> (Vec<f64>, Option<Vec<f64>>) {
        let r = self
            .positions
            .iter()
            .map(|&p| kernel(p, position, self.length_scale))
            .collect_vec();
        let params = self
            .mean
            .iter()
            .zip(self.alpha.columns())
            .map(|(m, alpha)| m + alpha.iter().zip(r.iter()).map(|(a, r)| a * r).sum::<f64>())
            .collect();
        let z = DVector::from_vec(self.forward_substitution(&r));
        let explained = z.norm_squared();
        let nugget = self.white_noise + JITTER;
        let variance = self
            .amplitude
            .iter()
            .map(|a| a * (1.0 + nugget - explained).max(0.0))
            .collect();
        (params, Some(variance))
    }
}
