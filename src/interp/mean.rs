use crate::error::InterpError;
use crate::interp::{FittedInterp, FittedStateTrait, InterpolatorTrait, validate};
use crate::types::Position;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Constant interpolant: the mean of training parameter vectors
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Mean {}

impl InterpolatorTrait for Mean {
    fn train(
        &self,
        positions: &[Position],
        params: &[Vec<f64>],
    ) -> Result<FittedInterp, InterpError> {
        let nparams = validate(self, positions, params)?;
        let n = params.len() as f64;
        let mean = (0..nparams)
            .map(|j| params.iter().map(|p| p[j]).sum::<f64>() / n)
            .collect();
        Ok(FittedInterp::new(MeanState { mean }.into(), positions))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeanState {
    mean: Vec<f64>,
}

impl FittedStateTrait for MeanState {
    fn nparams(&self) -> usize {
        self.mean.len()
    }

    fn evaluate(&self, _position: Position) -> (Vec<f64>, Option<Vec<f64>>) {
        (self.mean.clone(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean() {
        let positions = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let params = [vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 60.0]];
        let fitted = Mean {}.train(&positions, &params).unwrap();
        let prediction = fitted.predict([0.2, 0.2]);
        assert_eq!(prediction.params, vec![2.0, 30.0]);
        assert_eq!(prediction.variance, None);
        assert!(!prediction.extrapolated);
        assert!(fitted.predict([5.0, 5.0]).extrapolated);
    }
}
