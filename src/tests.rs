pub use crate::data::{Jacobian, StampGeometry, StarData};
pub use crate::error::{FitError, InterpError};
pub use crate::model::{Model, ModelTrait, RadialProfile};
pub use crate::types::Position;

pub use approx::{assert_abs_diff_eq, assert_relative_eq};
pub use itertools::Itertools;
pub use ndarray::Array2;
pub use rand::prelude::*;

use field_psf_test_util::{NOISE, StarArrays, gaussian_catalog};

/// Check that a model recovers parameters, flux and centroid of noiseless stars it drew itself
#[macro_export]
macro_rules! model_test {
    ($name: ident, $model: expr_2021, $params: expr_2021 $(,)?) => {
        model_test!($name, $model, $params, 1e-5);
    };
    ($name: ident, $model: expr_2021, $params: expr_2021, $tol: expr_2021 $(,)?) => {
        #[test]
        fn $name() {
            let model: Model = $model.into();
            let mut rng = StdRng::seed_from_u64(0);
            for params in $params {
                let flux = rng.random_range(100.0..10000.0);
                let center = [rng.random_range(-0.2..0.2), rng.random_range(-0.2..0.2)];
                let star = draw_star(&model, &params, flux, center, 31, 0.3);

                let fit = model.fit(&star, 100);
                assert!(!fit.flag, "{:?} failed: {:?}", params, fit.failure);
                assert_eq!(fit.params.len(), model.nparams());
                assert_abs_diff_eq!(&fit.params[..], &params[..], epsilon = $tol);
                assert_relative_eq!(fit.flux, flux, max_relative = $tol);
                assert_abs_diff_eq!(&fit.center[..], &center[..], epsilon = $tol);
                assert_eq!(fit.dof, 31 * 31 - model.nparams() as i64);

                let redrawn = model.draw(&fit.params, fit.flux, fit.center, star.geometry());
                assert_abs_diff_eq!(
                    redrawn,
                    star.image().to_owned(),
                    epsilon = $tol * flux
                );
            }
        }
    };
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Noiseless star with unit weights in the middle of the field
pub fn draw_star(
    model: &Model,
    params: &[f64],
    flux: f64,
    center: Position,
    size: usize,
    pixel_scale: f64,
) -> StarData {
    let geometry = StampGeometry::centered(size, Jacobian::pixel_scale(pixel_scale));
    let image = model.draw(params, flux, center, &geometry);
    StarData::new(
        image,
        Array2::ones(geometry.shape),
        geometry.image_pos,
        [0.0, 0.0],
        geometry.jacobian,
    )
    .unwrap()
}

/// $2\pi \int_0^{r_\mathrm{max}} f(r^2) r dr$ of a round profile of unit scale
pub fn radial_integral(profile: &impl RadialProfile, r_max: f64) -> f64 {
    const N: usize = 1_000_000;
    let dr = r_max / N as f64;
    (0..N)
        .map(|i| {
            let r = (i as f64 + 0.5) * dr;
            profile.value_dq(r * r).0 * r
        })
        .sum::<f64>()
        * 2.0
        * std::f64::consts::PI
        * dr
}

/// Positions uniformly distributed over $[-1, 1]^2$
pub fn random_positions(rng: &mut StdRng, n: usize) -> Vec<Position> {
    field_psf_test_util::random_positions(n, rng)
}

pub fn star_from_arrays(star: &StarArrays) -> StarData {
    StarData::new(
        star.image.clone(),
        star.weight.clone(),
        star.image_pos,
        star.field_pos,
        Jacobian::pixel_scale(star.pixel_scale),
    )
    .unwrap()
}

/// Noisy Gaussian stars following [field_psf_test_util::linear_field]
pub fn catalog(positions: &[Position], seed: u64) -> Vec<StarData> {
    gaussian_catalog(positions, NOISE, seed)
        .iter()
        .map(star_from_arrays)
        .collect()
}

pub fn noiseless_catalog(positions: &[Position], seed: u64) -> Vec<StarData> {
    gaussian_catalog(positions, 0.0, seed)
        .iter()
        .map(star_from_arrays)
        .collect()
}
