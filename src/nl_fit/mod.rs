//! Non-linear least-squares infrastructure for fitting PSF profiles to star stamps.
//!
//! # Parameter spaces
//!
//! Models are fitted in two parameter spaces:
//!
//! ## External parameters
//!
//! Physical parameters as they are reported in [StarFit](crate::StarFit): flux in image units,
//! centroid and scale in world units, dimensionless reduced shear.
//!
//! ## Internal parameters
//!
//! The parameters seen by the optimizer. Flux is divided by the flux of the adaptive moments,
//! centroid and scale are divided by the moment size, so every parameter is O(1) whatever the
//! pixel scale and brightness of the star. Bounds are transformed the same way:
//!
//! ```text
//! flux  >= 0
//! scale >= SCALE_MIN
//! |g1|, |g2| <= 0.7
//! ```
//!
//! # Fitting workflow
//!
//! 1. Measure adaptive moments of the stamp and build the starting point.
//! 2. Transform the starting point to internal parameters.
//! 3. Run [LmCurveFit] on a [LeastSquaresProblem] whose residuals are
//!    $\sqrt{w}\,(I - \mathrm{model})$ over weighted pixels.
//! 4. Transform the result back to external parameters.

mod bounds;

pub mod curve_fit;
pub use curve_fit::{CurveFitResult, CurveFitTrait, LeastSquaresProblem};

pub mod lm;
pub use lm::LmCurveFit;
