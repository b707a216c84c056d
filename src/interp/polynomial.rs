use crate::error::InterpError;
use crate::interp::{FittedInterp, FittedStateTrait, InterpolatorTrait, validate};
use crate::types::Position;

use itertools::Itertools;
use macro_const::macro_const;
use nalgebra::DMatrix;
use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_const! {
    const DOC: &str = r"
Two-dimensional polynomial of total degree `order`

Every parameter is fitted independently by least squares:
$$
p(u, v) = \sum_{i + j \le \mathrm{order}} c_{ij}\, \hat u^i \hat v^j,
$$
where $\hat u$, $\hat v$ are field coordinates linearly mapped to $[-1, 1]$ over the bounding
box of the training positions. The system is solved with SVD, so degenerate layouts produce the
minimum-norm solution instead of failing. With fewer training points than basis functions the
highest order the points can constrain is used instead.

- Number of basis functions: $(\mathrm{order} + 1)(\mathrm{order} + 2) / 2$
";
}

/// Relative singular value cutoff of the least-squares solution
const SVD_EPS: f64 = 1e-12;

#[doc = DOC!()]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Polynomial {
    order: usize,
}

impl Polynomial {
    pub fn new(order: usize) -> Self {
        Self { order }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    pub fn default_order() -> usize {
        1
    }

    pub fn doc() -> &'static str {
        DOC
    }
}

impl Default for Polynomial {
    fn default() -> Self {
        Self::new(Self::default_order())
    }
}

/// Number of monomials of total degree up to `order`
#[inline]
fn n_basis(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Monomials $\hat u^i \hat v^j$ ordered by total degree
fn basis(order: usize, [u, v]: Position) -> Vec<f64> {
    let mut out = Vec::with_capacity(n_basis(order));
    for degree in 0..=order {
        for j in 0..=degree {
            out.push(u.powi((degree - j) as i32) * v.powi(j as i32));
        }
    }
    out
}

impl Polynomial {
    /// Highest order not exceeding the configured one with at most `npoints` basis functions
    fn effective_order(&self, npoints: usize) -> usize {
        (0..=self.order)
            .rev()
            .find(|&order| n_basis(order) <= npoints)
            .unwrap_or(0)
    }
}

impl InterpolatorTrait for Polynomial {
    fn train(
        &self,
        positions: &[Position],
        params: &[Vec<f64>],
    ) -> Result<FittedInterp, InterpError> {
        let nparams = validate(self, positions, params)?;
        let order = self.effective_order(positions.len());
        if order < self.order {
            log::warn!(
                "{} training points cannot constrain a polynomial of order {}, order {order} is used",
                positions.len(),
                self.order
            );
        }
        let normalization = Normalization::new(positions);
        let n_basis = n_basis(order);

        let rows = positions
            .iter()
            .map(|&p| basis(order, normalization.apply(p)))
            .collect_vec();
        let design = DMatrix::from_fn(positions.len(), n_basis, |i, k| rows[i][k]);
        let rhs = DMatrix::from_fn(positions.len(), nparams, |i, j| params[i][j]);
        let solution = design
            .svd(true, true)
            .solve(&rhs, SVD_EPS)
            .map_err(|_| InterpError::Singular)?;
        if !solution.iter().all(|x| x.is_finite()) {
            return Err(InterpError::Singular);
        }
        let coefficients = Array2::from_shape_fn((n_basis, nparams), |(k, j)| solution[(k, j)]);

        let state = PolynomialState {
            order,
            normalization,
            coefficients,
        };
        Ok(FittedInterp::new(state.into(), positions))
    }
}

/// Linear map of the bounding box of training positions to $[-1, 1]^2$
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct Normalization {
    center: Position,
    half_range: Position,
}

impl Normalization {
    fn new(positions: &[Position]) -> Self {
        let mut center = [0.0; 2];
        let mut half_range = [1.0; 2];
        for axis in 0..2 {
            let (min, max) = positions
                .iter()
                .map(|p| p[axis])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), x| {
                    (min.min(x), max.max(x))
                });
            center[axis] = 0.5 * (min + max);
            if max > min {
                half_range[axis] = 0.5 * (max - min);
            }
        }
        Self { center, half_range }
    }

    #[inline]
    fn apply(&self, p: Position) -> Position {
        [
            (p[0] - self.center[0]) / self.half_range[0],
            (p[1] - self.center[1]) / self.half_range[1],
        ]
    }
}

/// Coefficients of a trained [Polynomial], `coefficients[(k, j)]` multiplies basis function `k`
/// for parameter `j`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolynomialState {
    order: usize,
    normalization: Normalization,
    coefficients: Array2<f64>,
}

impl FittedStateTrait for PolynomialState {
    fn nparams(&self) -> usize {
        self.coefficients.ncols()
    }

    fn evaluate(&self, position: Position) -> (Vec<f64>, Option<Vec<f64>>) {
        let b = basis(self.order, self.normalization.apply(position));
        let params = self
            .coefficients
            .columns()
            .into_iter()
            .map(|c| c.iter().zip(b.iter()).map(|(c, b)| c * b).sum())
            .collect();
        (params, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::FittedState;
    use crate::tests::*;

    #[test]
    fn basis_size() {
        for order in 0..5 {
            assert_eq!(basis(order, [0.3, 0.4]).len(), n_basis(order));
        }
        assert_eq!(basis(2, [2.0, 3.0]), vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
    }

    #[test]
    fn exact_at_nodes() {
        let mut rng = StdRng::seed_from_u64(0);
        for order in 1..4 {
            let interp = Polynomial::new(order);
            let positions = random_positions(&mut rng, n_basis(order));
            let params = positions
                .iter()
                .map(|_| vec![rng.random::<f64>(), rng.random::<f64>()])
                .collect_vec();
            let fitted = interp.train(&positions, &params).unwrap();
            for (p, desired) in positions.iter().zip(params.iter()) {
                assert_abs_diff_eq!(&fitted.predict(*p).params[..], &desired[..], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn order_is_lowered_for_few_points() {
        let mut rng = StdRng::seed_from_u64(2);
        // Three parameters need four points, which constrain a linear polynomial at most
        let positions = random_positions(&mut rng, 4);
        let f = |[x, y]: Position| vec![1.0 + 0.1 * x - 0.05 * y, 0.03 * x, -0.02 * y];
        let params = positions.iter().map(|&p| f(p)).collect_vec();
        for order in [2, 3] {
            let interp = Polynomial::new(order);
            assert_eq!(interp.min_points(3), 4);
            assert_eq!(interp.effective_order(4), 1);
            let fitted = interp.train(&positions, &params).unwrap();
            let FittedState::Polynomial(state) = fitted.state() else {
                panic!("unexpected state {:?}", fitted.state());
            };
            assert_eq!(state.order, 1);
            assert_eq!(fitted.npoints(), 4);
            for p in [[0.0, 0.0], [0.3, -0.2], positions[2]] {
                assert_abs_diff_eq!(&fitted.predict(p).params[..], &f(p)[..], epsilon = 1e-10);
            }
        }
        assert_eq!(Polynomial::new(3).effective_order(10), 3);
        assert_eq!(Polynomial::new(3).effective_order(9), 2);
        assert_eq!(Polynomial::new(2).effective_order(1), 0);
    }

    #[test]
    fn reproduces_polynomial() {
        let mut rng = StdRng::seed_from_u64(1);
        let positions = random_positions(&mut rng, 30)
            .into_iter()
            .map(|[x, y]| [100.0 + 2000.0 * x, -50.0 + 1000.0 * y])
            .collect_vec();
        let f = |[x, y]: Position| 1.0 + 1e-3 * x - 2e-3 * y + 1e-7 * x * y + 3e-7 * y * y;
        let params = positions.iter().map(|&p| vec![f(p)]).collect_vec();
        let fitted = Polynomial::new(2).train(&positions, &params).unwrap();
        for p in [[100.0, -50.0], [500.0, 300.0], [-1000.0, 0.0]] {
            assert_relative_eq!(fitted.predict(p).params[0], f(p), max_relative = 1e-9);
        }
    }

    #[test]
    fn degenerate_layout() {
        // All stars on one line, the v-dependence is undetermined
        let positions = (0..5).map(|i| [i as f64, 3.0]).collect_vec();
        let params = positions.iter().map(|p| vec![2.0 * p[0]]).collect_vec();
        let fitted = Polynomial::new(1).train(&positions, &params).unwrap();
        assert_relative_eq!(fitted.predict([2.5, 3.0]).params[0], 5.0, epsilon = 1e-10);
    }
}
