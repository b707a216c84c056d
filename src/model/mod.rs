//! PSF models: parametric surface-brightness profiles fitted to individual stars

use crate::data::{Residual, StampGeometry, StarData, StarFit};
use crate::error::FitError;
use crate::types::Position;

use enum_dispatch::enum_dispatch;
use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod airy;
pub use airy::Airy;

mod gaussian;
pub use gaussian::Gaussian;

mod moffat;
pub use moffat::Moffat;

mod profile;
pub use profile::{MAX_SHEAR, ProfileOptions, RadialProfile};

/// Operations every PSF model provides
#[enum_dispatch]
pub trait ModelTrait {
    /// Number of interpolated parameters, the length of [StarFit::params]
    fn nparams(&self) -> usize;

    /// Names of interpolated parameters in the order they appear in [StarFit::params]
    fn param_names(&self) -> &'static [&'static str];

    /// Starting fit from adaptive moments of the stamp, without any optimization
    fn initialize(&self, star: &StarData) -> Result<StarFit, FitError>;

    /// Fit the model to a single star
    ///
    /// Never fails: any problem results in a flagged [StarFit] which keeps the error.
    fn fit(&self, star: &StarData, max_iterations: usize) -> StarFit;

    /// Render the model onto a stamp
    ///
    /// `center` shifts the model in world coordinates on top of the centroid parameters, if the
    /// model has any. Pixel values are surface brightness integrated over pixel area.
    ///
    /// Panics if `params` has a wrong length.
    fn draw(
        &self,
        params: &[f64],
        flux: f64,
        center: Position,
        geometry: &StampGeometry,
    ) -> Array2<f64>;

    /// Refit flux of a model with fixed `params` to a star
    ///
    /// The centroid is refitted too when `fit_center` is set and the model keeps the centroid
    /// out of `params`. `start` provides the starting flux and centroid.
    fn reflux(
        &self,
        star: &StarData,
        params: &[f64],
        start: &StarFit,
        fit_center: bool,
        max_iterations: usize,
    ) -> Result<Residual, FitError>;
}

/// PSF model family
#[enum_dispatch(ModelTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[non_exhaustive]
pub enum Model {
    Gaussian(Gaussian),
    Moffat(Moffat),
    Airy(Airy),
}

impl Model {
    pub fn gaussian() -> Self {
        Gaussian::default().into()
    }

    pub fn moffat(beta: f64) -> Self {
        Moffat::new(beta, ProfileOptions::default()).into()
    }

    pub fn airy() -> Self {
        Airy::default().into()
    }

    /// Check parameters which deserialization cannot check
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Self::Moffat(model) => model.validate(),
            Self::Gaussian(_) | Self::Airy(_) => Ok(()),
        }
    }

    pub fn options(&self) -> &ProfileOptions {
        match self {
            Self::Gaussian(model) => model.options(),
            Self::Moffat(model) => model.options(),
            Self::Airy(model) => model.options(),
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::gaussian()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    #[test]
    fn param_names() {
        assert_eq!(Model::gaussian().param_names(), &["scale", "g1", "g2"]);
        let free_center: Model =
            Moffat::new(2.5, ProfileOptions::default().with_force_model_center(false)).into();
        assert_eq!(free_center.nparams(), 5);
        assert_eq!(free_center.param_names()[..2], ["du", "dv"]);
    }

    #[test]
    fn free_center_round_trip() {
        let model: Model =
            Gaussian::new(ProfileOptions::default().with_force_model_center(false)).into();
        let params = [0.12, -0.07, 1.1, 0.05, 0.1];
        let star = draw_star(&model, &params, 500.0, [0.0, 0.0], 31, 0.3);
        let fit = model.fit(&star, 100);
        assert!(!fit.flag, "{:?}", fit.failure);
        assert_eq!(fit.center, [0.0, 0.0]);
        assert_abs_diff_eq!(&fit.params[..], &params[..], epsilon = 1e-5);
        assert_relative_eq!(fit.flux, 500.0, max_relative = 1e-5);
        assert_eq!(fit.dof, 31 * 31 - 5);
    }

    #[test]
    fn masked_star_is_flagged() {
        let model = Model::gaussian();
        let star = draw_star(&model, &[1.0, 0.0, 0.0], 100.0, [0.0, 0.0], 15, 0.3);
        let masked = StarData::new(
            star.image().to_owned(),
            Array2::zeros((15, 15)),
            star.image_pos(),
            star.field_pos(),
            *star.jacobian(),
        )
        .unwrap();
        let fit = model.fit(&masked, 100);
        assert!(fit.flag);
        assert_eq!(fit.failure, Some(FitError::NoWeightedPixels));
    }

    #[test]
    fn tiny_stamp_is_flagged() {
        let model = Model::gaussian();
        let star = draw_star(&model, &[1.0, 0.0, 0.0], 100.0, [0.0, 0.0], 2, 0.3);
        let fit = model.fit(&star, 100);
        assert!(fit.flag);
        assert_eq!(
            fit.failure,
            Some(FitError::TooFewPixels {
                actual: 4,
                minimum: 7
            })
        );
    }

    #[test]
    fn iteration_cap_flags_star() {
        let model = Model::moffat(2.5);
        let star = draw_star(&model, &[1.3, 0.2, -0.1], 100.0, [0.1, 0.1], 31, 0.3);
        let fit = model.fit(&star, 1);
        assert!(fit.flag);
        assert!(matches!(
            fit.failure,
            Some(FitError::NotConverged { iterations: 1 })
        ));
    }

    #[test]
    fn zero_iterations_flags_star() {
        let model = Model::gaussian();
        let star = draw_star(&model, &[1.0, 0.05, 0.0], 100.0, [0.0, 0.0], 21, 0.3);
        let fit = model.fit(&star, 0);
        assert!(fit.flag);
        assert_eq!(fit.failure, Some(FitError::NotConverged { iterations: 0 }));
    }

    #[test]
    fn reflux_recovers_flux_and_center() {
        let model = Model::gaussian();
        let params = [1.0, 0.1, 0.05];
        let star = draw_star(&model, &params, 300.0, [0.07, -0.04], 25, 0.3);
        let start = StarFit::new(params.to_vec(), 100.0, [0.0, 0.0], 0.0, 0);

        let residual = model.reflux(&star, &params, &start, true, 100).unwrap();
        assert_relative_eq!(residual.flux, 300.0, max_relative = 1e-6);
        assert_abs_diff_eq!(&residual.center[..], &[0.07, -0.04][..], epsilon = 1e-6);
        assert_eq!(residual.dof, 25 * 25 - 3);
        assert!(residual.chisq < 1e-8);

        let start = StarFit::new(params.to_vec(), 100.0, [0.07, -0.04], 0.0, 0);
        let residual = model.reflux(&star, &params, &start, false, 100).unwrap();
        assert_relative_eq!(residual.flux, 300.0, max_relative = 1e-10);
        assert_eq!(residual.center, [0.07, -0.04]);
        assert_eq!(residual.dof, 25 * 25 - 1);
    }

    #[test]
    fn initialize_from_moments() {
        let model = Model::gaussian();
        let star = draw_star(&model, &[1.0, 0.0, 0.0], 100.0, [0.0, 0.0], 31, 0.25);
        let fit = model.initialize(&star).unwrap();
        assert!(!fit.flag);
        // Moments see the pixel-convolved profile, the starting scale is slightly larger
        assert_relative_eq!(fit.params[0], 1.0, max_relative = 0.05);
        assert_relative_eq!(fit.flux, 100.0, max_relative = 0.05);
    }

    #[test]
    fn serde_json_round_trip() {
        for model in [
            Model::gaussian(),
            Model::moffat(3.0),
            Airy::new(ProfileOptions::default().with_include_pixel(false)).into(),
        ] {
            let json = serde_json::to_string(&model).unwrap();
            let deserialized: Model = serde_json::from_str(&json).unwrap();
            assert_eq!(model, deserialized);
        }
    }
}
