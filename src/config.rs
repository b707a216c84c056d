use crate::error::SolveError;
use crate::interp::{ExtrapolationPolicy, Interpolator};
use crate::model::Model;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sigma-clipping of stars by the reduced $\chi^2$ of their residuals
///
/// A star is rejected when its reduced $\chi^2$ exceeds
/// $\mathrm{median} + \mathrm{nsigma} \times \max(1.4826\,\mathrm{MAD}, \mathrm{min\_spread})$,
/// where the median and the median absolute deviation are taken over the active training stars.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutlierConfig {
    #[serde(default = "OutlierConfig::default_nsigma")]
    pub nsigma: f64,
    /// Lower limit of the robust spread, keeps noise-free data from rejecting everything
    #[serde(default = "OutlierConfig::default_min_spread")]
    pub min_spread: f64,
    /// Maximum fraction of active training stars rejected per iteration, all candidates are
    /// rejected if `None`
    #[serde(default)]
    pub max_remove: Option<f64>,
}

impl OutlierConfig {
    #[inline]
    pub fn default_nsigma() -> f64 {
        4.0
    }

    #[inline]
    pub fn default_min_spread() -> f64 {
        1e-3
    }

    fn validate(&self) -> Result<(), SolveError> {
        if !(self.nsigma.is_finite() && self.nsigma > 0.0) {
            return Err(SolveError::InvalidConfig(format!(
                "nsigma must be positive, {} given",
                self.nsigma
            )));
        }
        if !(self.min_spread.is_finite() && self.min_spread >= 0.0) {
            return Err(SolveError::InvalidConfig(format!(
                "min_spread must be non-negative, {} given",
                self.min_spread
            )));
        }
        if let Some(max_remove) = self.max_remove {
            if !(max_remove > 0.0 && max_remove <= 1.0) {
                return Err(SolveError::InvalidConfig(format!(
                    "max_remove must be in (0, 1], {max_remove} given"
                )));
            }
        }
        Ok(())
    }
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            nsigma: Self::default_nsigma(),
            min_spread: Self::default_min_spread(),
            max_remove: None,
        }
    }
}

/// Configuration of a fitting session
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PsfConfig {
    #[serde(default)]
    pub model: Model,
    #[serde(default)]
    pub interp: Interpolator,
    /// Fraction of stars held out of interpolator training
    #[serde(default)]
    pub reserve_frac: f64,
    /// Seed of the reserve-star selection
    #[serde(default = "PsfConfig::default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub outliers: OutlierConfig,
    /// Maximum number of fit-reject iterations
    #[serde(default = "PsfConfig::default_max_iterations")]
    pub max_iterations: usize,
    /// Maximum number of optimizer steps of a single-star fit
    #[serde(default = "PsfConfig::default_max_fit_iterations")]
    pub max_fit_iterations: usize,
    /// Size of the worker pool of single-star fits, rayon's default if `None`
    #[serde(default)]
    pub num_workers: Option<usize>,
    /// Wall-clock budget of a session in seconds
    #[serde(default)]
    pub time_budget: Option<f64>,
    /// Refit centroids together with flux when comparing the interpolated model to stars
    #[serde(default = "PsfConfig::default_fit_center")]
    pub fit_center: bool,
    #[serde(default)]
    pub extrapolation: ExtrapolationPolicy,
}

impl PsfConfig {
    #[inline]
    pub fn default_seed() -> u64 {
        1234
    }

    #[inline]
    pub fn default_max_iterations() -> usize {
        30
    }

    #[inline]
    pub fn default_max_fit_iterations() -> usize {
        100
    }

    #[inline]
    pub fn default_fit_center() -> bool {
        true
    }

    pub fn with_model(mut self, model: impl Into<Model>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_interp(mut self, interp: impl Into<Interpolator>) -> Self {
        self.interp = interp.into();
        self
    }

    pub fn with_reserve_frac(mut self, reserve_frac: f64) -> Self {
        self.reserve_frac = reserve_frac;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_outliers(mut self, outliers: OutlierConfig) -> Self {
        self.outliers = outliers;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn with_time_budget(mut self, seconds: f64) -> Self {
        self.time_budget = Some(seconds);
        self
    }

    pub fn with_extrapolation(mut self, extrapolation: ExtrapolationPolicy) -> Self {
        self.extrapolation = extrapolation;
        self
    }

    pub fn validate(&self) -> Result<(), SolveError> {
        if !(0.0..1.0).contains(&self.reserve_frac) {
            return Err(SolveError::InvalidConfig(format!(
                "reserve_frac must be in [0, 1), {} given",
                self.reserve_frac
            )));
        }
        if self.max_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "max_iterations must be positive".to_owned(),
            ));
        }
        if self.max_fit_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "max_fit_iterations must be positive".to_owned(),
            ));
        }
        if self.num_workers == Some(0) {
            return Err(SolveError::InvalidConfig(
                "num_workers must be positive".to_owned(),
            ));
        }
        if let Some(time_budget) = self.time_budget {
            if !(time_budget >= 0.0) {
                return Err(SolveError::InvalidConfig(format!(
                    "time_budget must be non-negative, {time_budget} given"
                )));
            }
        }
        self.model
            .validate()
            .and_then(|()| self.interp.validate())
            .map_err(SolveError::InvalidConfig)?;
        self.outliers.validate()
    }
}

impl Default for PsfConfig {
    fn default() -> Self {
        Self {
            model: Model::default(),
            interp: Interpolator::default(),
            reserve_frac: 0.0,
            seed: Self::default_seed(),
            outliers: OutlierConfig::default(),
            max_iterations: Self::default_max_iterations(),
            max_fit_iterations: Self::default_max_fit_iterations(),
            num_workers: None,
            time_budget: None,
            fit_center: Self::default_fit_center(),
            extrapolation: ExtrapolationPolicy::default(),
        }
    }
}
