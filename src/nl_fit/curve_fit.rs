use nalgebra::{DMatrix, DVector};

/// Weighted non-linear least-squares problem
///
/// The objective is $\chi^2 = \sum_i r_i^2$ over the residual vector $r$, residuals are already
/// multiplied by the square root of the pixel weight.
pub trait LeastSquaresProblem {
    /// Number of residuals
    fn ndata(&self) -> usize;

    /// Fill `residuals` for the parameter vector `x`
    fn residuals(&self, x: &[f64], residuals: &mut DVector<f64>);

    /// Fill `residuals` and their derivatives, `jacobian[(i, j)]` is $\partial r_i / \partial x_j$
    fn residuals_jacobian(&self, x: &[f64], residuals: &mut DVector<f64>, jacobian: &mut DMatrix<f64>);
}

/// Result of a curve fit
#[derive(Clone, Debug, PartialEq)]
pub struct CurveFitResult {
    /// Best-fit parameters, always within bounds
    pub x: Vec<f64>,
    /// Objective value at `x`
    pub chi2: f64,
    /// Number of accepted steps
    pub iterations: usize,
    /// Convergence was reached before the iteration cap
    pub success: bool,
}

pub trait CurveFitTrait {
    fn curve_fit<P: LeastSquaresProblem>(
        &self,
        problem: &P,
        x0: &[f64],
        bounds: (&[f64], &[f64]),
    ) -> CurveFitResult;
}
