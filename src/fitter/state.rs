use crate::data::{Residual, StarFit};
use crate::error::FitError;
use crate::types::StarIndex;

use serde::{Deserialize, Serialize};

/// States of the fit-reject loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Phase {
    Init,
    FitStars,
    FitInterp,
    ComputeResiduals,
    Reject,
    Done(Termination),
}

/// How a successful session ended
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Termination {
    /// The last iteration rejected no training stars
    Converged,
    /// The iteration cap was hit while stars were still being rejected
    MaxIterations,
    /// The time budget ran out, the solution is the one of the last completed iteration
    Cancelled,
}

/// Why a star was excluded from fitting
#[derive(Clone, Debug, PartialEq)]
pub enum FlagReason {
    /// Flagged by the caller when resuming a session
    Preset,
    /// Single-star model fit failed
    FitFailed(FitError),
    /// Interpolated model could not be refitted to the star
    ResidualFailed(FitError),
    /// Rejected by sigma-clipping of the residual reduced $\chi^2$
    Outlier {
        iteration: usize,
        reduced_chisq: f64,
        threshold: f64,
    },
}

/// Everything the session knows about a single star
#[derive(Clone, Debug, PartialEq)]
pub struct StarRecord {
    /// The star is held out of interpolator training
    pub reserve: bool,
    /// Last single-star fit, `None` if the star was never fitted
    pub fit: Option<StarFit>,
    /// Interpolated model compared to the star at the last iteration it was active
    pub residual: Option<Residual>,
    pub flag: Option<FlagReason>,
}

impl StarRecord {
    pub(super) fn new(reserve: bool, preset_flag: bool) -> Self {
        Self {
            reserve,
            fit: None,
            residual: None,
            flag: preset_flag.then_some(FlagReason::Preset),
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.flag.is_some()
    }

    /// The star takes part in interpolator training and in the rejection statistic
    pub fn is_training(&self) -> bool {
        !self.reserve && !self.is_flagged()
    }

    pub(super) fn set_flag(&mut self, reason: FlagReason) {
        debug_assert!(self.flag.is_none(), "star is already flagged");
        if let Some(fit) = self.fit.as_mut() {
            fit.flag = true;
        }
        self.flag = Some(reason);
    }
}

/// Per-iteration record of the fit-reject loop
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IterationSummary {
    /// One-based iteration number
    pub iteration: usize,
    /// Stars used to train the interpolator
    pub n_training: usize,
    /// Reserve stars which are still not flagged
    pub n_reserve: usize,
    /// Stars whose single-star fit failed at this iteration
    pub n_fit_failed: usize,
    /// Stars whose residual could not be computed at this iteration
    pub n_residual_failed: usize,
    /// Stars rejected by sigma-clipping at this iteration
    pub n_rejected: usize,
    /// Training stars excluded after the interpolator was trained, zero for the converged
    /// iteration
    pub n_training_removed: usize,
    /// Snapshot of all flagged stars after the iteration, in ascending order
    pub flagged: Vec<StarIndex>,
    /// Median of the residual reduced $\chi^2$ over training stars
    pub median: f64,
    /// Rejection threshold of the residual reduced $\chi^2$
    pub threshold: f64,
}
