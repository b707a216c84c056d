use crate::data::{Residual, StampGeometry, StarData};
use crate::error::{FitError, PsfError};
use crate::interp::{FittedInterp, Prediction};
use crate::model::{Model, ModelTrait};
use crate::types::Position;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Spatially varying PSF: a model family with parameters interpolated over the field of view
///
/// Immutable after construction, all queries take `&self` and can be run from many threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Psf {
    model: Model,
    interp: FittedInterp,
}

/// PSF at a single field position
#[derive(Clone, Debug)]
pub struct PsfInstance<'a> {
    model: &'a Model,
    pub position: Position,
    pub params: Vec<f64>,
    pub variance: Option<Vec<f64>>,
    /// The position is outside of the training domain of the interpolator
    pub extrapolated: bool,
}

impl Psf {
    pub fn new(model: Model, interp: FittedInterp) -> Result<Self, PsfError> {
        if model.nparams() != interp.nparams() {
            return Err(PsfError::ParameterMismatch {
                interp: interp.nparams(),
                model: model.nparams(),
            });
        }
        Ok(Self { model, interp })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn interp(&self) -> &FittedInterp {
        &self.interp
    }

    pub fn get_psf(&self, position: Position) -> PsfInstance<'_> {
        let Prediction {
            params,
            variance,
            extrapolated,
        } = self.interp.predict(position);
        if extrapolated {
            log::debug!("PSF requested at {position:?} outside of the interpolation domain");
        }
        PsfInstance {
            model: &self.model,
            position,
            params,
            variance,
            extrapolated,
        }
    }

    /// Fit flux (and centroid if `fit_center`) of the PSF at the star position to the star
    ///
    /// Returns the rendered model together with the fitted values.
    pub fn draw_star(
        &self,
        star: &StarData,
        fit_center: bool,
        max_iterations: usize,
    ) -> Result<(Array2<f64>, Residual), FitError> {
        let instance = self.get_psf(star.field_pos());
        let start = self.model.initialize(star)?;
        let residual = self.model.reflux(
            star,
            &instance.params,
            &start,
            fit_center,
            max_iterations,
        )?;
        let image = instance.draw(star.geometry(), residual.flux, residual.center);
        Ok((image, residual))
    }
}

impl PsfInstance<'_> {
    pub fn draw(&self, geometry: &StampGeometry, flux: f64, center: Position) -> Array2<f64> {
        self.model.draw(&self.params, flux, center, geometry)
    }
}
