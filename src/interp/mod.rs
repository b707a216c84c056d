//! Interpolation of model parameters over the field of view

use crate::error::InterpError;
use crate::types::Position;

use enum_dispatch::enum_dispatch;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod domain;
pub use domain::TrainingDomain;

mod gp;
pub use gp::{GaussianProcess, GaussianProcessState};

mod mean;
pub use mean::{Mean, MeanState};

mod polynomial;
pub use polynomial::{Polynomial, PolynomialState};

/// Training of an interpolator
#[enum_dispatch]
pub trait InterpolatorTrait {
    /// Minimum number of training points for parameter vectors of size `nparams`
    fn min_points(&self, nparams: usize) -> usize {
        nparams + 1
    }

    /// Fit the interpolant to parameter vectors given at field positions
    ///
    /// The returned state owns everything required for predictions, it is rebuilt from scratch
    /// on every call.
    fn train(&self, positions: &[Position], params: &[Vec<f64>])
    -> Result<FittedInterp, InterpError>;
}

/// Interpolator configuration
#[enum_dispatch(InterpolatorTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum Interpolator {
    Mean(Mean),
    Polynomial(Polynomial),
    GaussianProcess(GaussianProcess),
}

impl Interpolator {
    pub fn mean() -> Self {
        Mean {}.into()
    }

    pub fn polynomial(order: usize) -> Self {
        Polynomial::new(order).into()
    }

    pub fn gaussian_process(length_scale: Option<f64>) -> Self {
        GaussianProcess::new(length_scale, None).into()
    }
}

impl Interpolator {
    /// Check parameters which deserialization cannot check
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Self::GaussianProcess(interp) => interp.validate(),
            Self::Mean(_) | Self::Polynomial(_) => Ok(()),
        }
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::polynomial(Polynomial::default_order())
    }
}

/// Evaluation of a trained interpolant
#[enum_dispatch]
pub trait FittedStateTrait {
    /// Size of predicted parameter vectors
    fn nparams(&self) -> usize;

    /// Predicted parameters and their variance, if the interpolant provides one
    fn evaluate(&self, position: Position) -> (Vec<f64>, Option<Vec<f64>>);
}

/// Trained interpolant of any of [Interpolator] variants
#[enum_dispatch(FittedStateTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum FittedState {
    Mean(MeanState),
    Polynomial(PolynomialState),
    GaussianProcess(GaussianProcessState),
}

/// What to do with a prediction outside of the [TrainingDomain]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ExtrapolationPolicy {
    /// Evaluate the interpolant as is
    #[default]
    Flag,
    /// Evaluate the interpolant at the closest point of the training domain
    Clamp,
}

/// Interpolator output at a single position
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub params: Vec<f64>,
    pub variance: Option<Vec<f64>>,
    /// The position is outside of the training domain
    pub extrapolated: bool,
}

/// Trained interpolator together with its training domain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FittedInterp {
    state: FittedState,
    domain: TrainingDomain,
    npoints: usize,
    #[serde(default)]
    policy: ExtrapolationPolicy,
}

impl FittedInterp {
    pub fn new(state: FittedState, positions: &[Position]) -> Self {
        Self {
            state,
            domain: TrainingDomain::new(positions),
            npoints: positions.len(),
            policy: ExtrapolationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExtrapolationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &FittedState {
        &self.state
    }

    pub fn domain(&self) -> &TrainingDomain {
        &self.domain
    }

    pub fn policy(&self) -> ExtrapolationPolicy {
        self.policy
    }

    /// Number of training points
    pub fn npoints(&self) -> usize {
        self.npoints
    }

    pub fn nparams(&self) -> usize {
        self.state.nparams()
    }

    pub fn predict(&self, position: Position) -> Prediction {
        let extrapolated = !self.domain.contains(position);
        let at = match self.policy {
            ExtrapolationPolicy::Clamp if extrapolated => self.domain.project(position),
            _ => position,
        };
        let (params, variance) = self.state.evaluate(at);
        Prediction {
            params,
            variance,
            extrapolated,
        }
    }
}

/// Common checks of training data, returns the size of parameter vectors
fn validate<I: InterpolatorTrait + ?Sized>(
    interp: &I,
    positions: &[Position],
    params: &[Vec<f64>],
) -> Result<usize, InterpError> {
    if positions.len() != params.len() {
        return Err(InterpError::LengthMismatch {
            positions: positions.len(),
            params: params.len(),
        });
    }
    let nparams = params.first().map_or(0, Vec::len);
    if let Some(p) = params.iter().find(|p| p.len() != nparams) {
        return Err(InterpError::DimensionMismatch {
            actual: p.len(),
            expected: nparams,
        });
    }
    let minimum = interp.min_points(nparams);
    if positions.len() < minimum {
        return Err(InterpError::InsufficientData {
            actual: positions.len(),
            minimum,
        });
    }
    let finite = positions
        .iter()
        .flat_map(|p| p.iter())
        .chain(params.iter().flatten())
        .all(|x| x.is_finite());
    if !finite {
        return Err(InterpError::NonFinite);
    }
    Ok(nparams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    fn interpolators() -> Vec<Interpolator> {
        vec![
            Interpolator::mean(),
            Interpolator::polynomial(0),
            Interpolator::polynomial(2),
            Interpolator::gaussian_process(Some(0.5)),
            Interpolator::gaussian_process(None),
        ]
    }

    #[test]
    fn minimum_number_of_points() {
        let mut rng = StdRng::seed_from_u64(0);
        for interp in interpolators() {
            for nparams in [1, 3, 5] {
                let minimum = interp.min_points(nparams);
                let positions = random_positions(&mut rng, minimum);
                let params = positions
                    .iter()
                    .map(|p| (0..nparams).map(|i| p[0] + i as f64 * p[1]).collect())
                    .collect_vec();
                assert_eq!(
                    interp.train(&positions[..minimum - 1], &params[..minimum - 1]),
                    Err(InterpError::InsufficientData {
                        actual: minimum - 1,
                        minimum
                    }),
                    "{interp:?}"
                );
                let fitted = interp.train(&positions, &params).unwrap();
                assert_eq!(fitted.nparams(), nparams);
                assert_eq!(fitted.npoints(), minimum);
            }
        }
    }

    #[test]
    fn inconsistent_input() {
        for interp in interpolators() {
            let positions = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.5, 0.5]]
                .into_iter()
                .cycle()
                .take(10)
                .collect_vec();
            let params = vec![vec![1.0]; 9];
            assert_eq!(
                interp.train(&positions, &params),
                Err(InterpError::LengthMismatch {
                    positions: 10,
                    params: 9
                })
            );
            let mut params = vec![vec![1.0]; 10];
            params[3] = vec![1.0, 2.0];
            assert_eq!(
                interp.train(&positions, &params),
                Err(InterpError::DimensionMismatch {
                    actual: 2,
                    expected: 1
                })
            );
            let mut params = vec![vec![1.0]; 10];
            params[3] = vec![f64::NAN];
            assert_eq!(interp.train(&positions, &params), Err(InterpError::NonFinite));
        }
    }

    #[test]
    fn extrapolation_policy() {
        let positions = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let params = positions.iter().map(|p| vec![p[0] + 2.0 * p[1]]).collect_vec();
        let fitted = Interpolator::polynomial(1).train(&positions, &params).unwrap();

        let inside = fitted.predict([0.5, 0.5]);
        assert!(!inside.extrapolated);
        assert_relative_eq!(inside.params[0], 1.5, epsilon = 1e-12);

        let outside = fitted.predict([2.0, 0.5]);
        assert!(outside.extrapolated);
        assert_relative_eq!(outside.params[0], 3.0, epsilon = 1e-12);

        let clamped = fitted.with_policy(ExtrapolationPolicy::Clamp).predict([2.0, 0.5]);
        assert!(clamped.extrapolated);
        assert_relative_eq!(clamped.params[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn serde_json_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let positions = random_positions(&mut rng, 20);
        let params = positions
            .iter()
            .map(|p| vec![p[0].sin() + p[1], 0.1 * p[0] * p[1]])
            .collect_vec();
        for interp in interpolators() {
            let fitted = interp.train(&positions, &params).unwrap();
            let json = serde_json::to_string(&fitted).unwrap();
            let deserialized: FittedInterp = serde_json::from_str(&json).unwrap();
            assert_eq!(fitted, deserialized);
            let config: Interpolator =
                serde_json::from_str(&serde_json::to_string(&interp).unwrap()).unwrap();
            assert_eq!(config, interp);
        }
    }
}
