use crate::error::FitError;
use crate::types::Position;

/// Result of fitting a model to a single star
///
/// `params` follow the order of [ModelTrait::param_names](crate::ModelTrait::param_names).
/// `center` is the world offset of the model centroid from the nominal stamp position which is
/// not carried by `params`: models which interpolate their centroid keep it in `params` and
/// report a zero `center` here.
#[derive(Clone, Debug, PartialEq)]
pub struct StarFit {
    pub params: Vec<f64>,
    pub flux: f64,
    pub center: Position,
    pub chisq: f64,
    /// Number of weighted pixels minus number of parameters
    pub dof: i64,
    /// The star is held out of interpolator training
    pub reserve: bool,
    /// The star is excluded from any further fitting
    pub flag: bool,
    /// Why the fit failed, if it did
    pub failure: Option<FitError>,
}

impl StarFit {
    pub fn new(params: Vec<f64>, flux: f64, center: Position, chisq: f64, dof: i64) -> Self {
        Self {
            params,
            flux,
            center,
            chisq,
            dof,
            reserve: false,
            flag: false,
            failure: None,
        }
    }

    /// Flagged fit carrying the reason of the failure
    pub fn failed(nparams: usize, error: FitError) -> Self {
        Self {
            params: vec![f64::NAN; nparams],
            flux: f64::NAN,
            center: [f64::NAN; 2],
            chisq: f64::NAN,
            dof: 0,
            reserve: false,
            flag: true,
            failure: Some(error),
        }
    }

    pub fn with_reserve(mut self, reserve: bool) -> Self {
        self.reserve = reserve;
        self
    }

    /// $\chi^2$ per degree of freedom, infinite if there are no degrees of freedom left
    pub fn reduced_chisq(&self) -> f64 {
        reduced_chisq(self.chisq, self.dof)
    }
}

/// Interpolated model compared against a star after its flux (and optionally centroid) were
/// refitted
#[derive(Clone, Debug, PartialEq)]
pub struct Residual {
    pub flux: f64,
    pub center: Position,
    pub chisq: f64,
    pub dof: i64,
}

impl Residual {
    pub fn reduced_chisq(&self) -> f64 {
        reduced_chisq(self.chisq, self.dof)
    }
}

fn reduced_chisq(chisq: f64, dof: i64) -> f64 {
    if dof > 0 {
        chisq / dof as f64
    } else {
        f64::INFINITY
    }
}
