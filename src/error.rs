use crate::types::{Position, StarIndex};

use serde::{Deserialize, Serialize};

/// Error returned from [crate::StarData] constructors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StarDataError {
    #[error("image shape {image:?} differs from weight shape {weight:?}")]
    ShapeMismatch {
        image: (usize, usize),
        weight: (usize, usize),
    },

    #[error("stamp must have at least one pixel")]
    EmptyStamp,

    #[error("{0} contains non-finite values")]
    NonFinite(&'static str),

    #[error("weight map contains negative values")]
    NegativeWeight,

    #[error("pixel-to-world jacobian is singular")]
    SingularJacobian,
}

/// Failure of a single-star fit
///
/// These errors never end a session: the star is flagged and the error is kept on its
/// [crate::StarFit].
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum FitError {
    #[error("stamp has no pixels with positive weight")]
    NoWeightedPixels,

    #[error("stamp has {actual} weighted pixels, at least {minimum} are required")]
    TooFewPixels { actual: usize, minimum: usize },

    #[error("adaptive moments failed: {0}")]
    Moments(&'static str),

    #[error("optimizer did not converge in {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("non-physical fit parameter {name} = {value}")]
    NonPhysical { name: &'static str, value: f64 },

    #[error("model evaluation produced non-finite values")]
    NonFinite,
}

/// Error returned from interpolator training
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InterpError {
    #[error("{actual} training points given, at least {minimum} are required")]
    InsufficientData { actual: usize, minimum: usize },

    #[error("positions and parameter vectors differ in length: {positions} != {params}")]
    LengthMismatch { positions: usize, params: usize },

    #[error("parameter vector of size {actual} found, {expected} expected")]
    DimensionMismatch { actual: usize, expected: usize },

    #[error("training data contain non-finite values")]
    NonFinite,

    #[error("interpolation system is singular")]
    Singular,
}

/// Error returned from [crate::Psf] construction
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PsfError {
    #[error("interpolator predicts {interp} parameters, the model requires {model}")]
    ParameterMismatch { interp: usize, model: usize },
}

/// Terminal failure of a fitting session
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("catalog is empty")]
    EmptyCatalog,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{actual} flag records given for {expected} stars")]
    FlagsMismatch { actual: usize, expected: usize },

    #[error("too few usable stars left at iteration {iteration}: {source}")]
    InsufficientStars {
        iteration: usize,
        #[source]
        source: InterpError,
    },

    #[error("interpolator training failed at iteration {iteration}: {source}")]
    Interpolation {
        iteration: usize,
        #[source]
        source: InterpError,
    },

    #[error("time budget exhausted before the first PSF was built")]
    Cancelled,

    #[error("cannot build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Psf(#[from] PsfError),
}

/// Non-fatal conditions reported alongside a solution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Warning {
    /// The rejection loop stopped at the iteration cap while still rejecting stars
    NonConvergence { iterations: usize },
    /// A prediction was requested outside the training domain of the interpolator
    DomainExtrapolation {
        star: Option<StarIndex>,
        position: Position,
    },
    /// The time budget ran out, the solution is the last completed iteration
    Cancelled { iteration: usize },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonConvergence { iterations } => {
                write!(f, "rejection loop did not converge in {iterations} iterations")
            }
            Self::DomainExtrapolation {
                star: Some(star),
                position,
            } => write!(
                f,
                "star {star} at {position:?} is outside of the interpolation domain"
            ),
            Self::DomainExtrapolation {
                star: None,
                position,
            } => write!(f, "position {position:?} is outside of the interpolation domain"),
            Self::Cancelled { iteration } => {
                write!(f, "time budget exhausted at iteration {iteration}")
            }
        }
    }
}
