#![doc = include_str!("../README.md")]

#[cfg(test)]
#[macro_use]
mod tests;

mod config;
pub use config::{OutlierConfig, PsfConfig};

mod data;
pub use data::{Jacobian, Residual, StampGeometry, StarData, StarFit};

mod error;
pub use error::{FitError, InterpError, PsfError, SolveError, StarDataError, Warning};

pub mod fitter;
pub use fitter::{FlagReason, IterationSummary, PsfFitter, PsfSolution, StarRecord, Termination};

pub mod interp;
pub use interp::{
    ExtrapolationPolicy, FittedInterp, GaussianProcess, Interpolator, InterpolatorTrait, Mean,
    Polynomial, Prediction, TrainingDomain,
};

mod moments;
pub use moments::{Moments, adaptive_moments};

pub mod model;
pub use model::{Airy, Gaussian, Model, ModelTrait, Moffat, ProfileOptions, RadialProfile};

#[doc(hidden)]
pub mod nl_fit;

pub mod prelude;

mod psf;
pub use psf::{Psf, PsfInstance};

pub mod reducer;
pub use reducer::{ChisqStats, FitReport, ShapeReport, ShapeStats};

mod sorted_array;

mod types;
pub use types::{Position, StarIndex};

pub use ndarray;
