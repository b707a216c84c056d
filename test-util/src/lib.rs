use field_psf::ndarray::Array2;
use field_psf::{Jacobian, Model, ModelTrait, StampGeometry};
use itertools::Itertools;
use rand::prelude::*;
use rand_distr::StandardNormal;

pub const STAMP_SIZE: usize = 25;
/// Arcsec per pixel
pub const PIXEL_SCALE: f64 = 0.3;
pub const FLUX: f64 = 1000.0;
/// Default standard deviation of pixel noise
pub const NOISE: f64 = 1.0;
/// Maximum absolute centroid offset from the stamp center, arcsec
pub const MAX_OFFSET: f64 = 0.1;

// We cannot return `StarData`, because it would be a different type for the crate's own unit
// tests, so stars are returned as plain arrays
#[derive(Clone, Debug)]
pub struct StarArrays {
    pub image: Array2<f64>,
    pub weight: Array2<f64>,
    pub image_pos: [f64; 2],
    pub field_pos: [f64; 2],
    pub pixel_scale: f64,
    /// True Gaussian parameters: scale, g1, g2
    pub params: Vec<f64>,
    pub flux: f64,
    pub center: [f64; 2],
}

impl StarArrays {
    /// Mask the whole stamp
    pub fn masked(mut self) -> Self {
        self.weight.fill(0.0);
        self
    }
}

/// Gaussian PSF parameters varying linearly over the $[-1, 1]^2$ field
pub fn linear_field([x, y]: [f64; 2]) -> Vec<f64> {
    vec![1.0 + 0.1 * x - 0.05 * y, 0.03 * x, -0.02 * y]
}

/// Regular grid of `nx` columns and `ny` rows covering $[-1, 1]^2$
pub fn grid_positions(nx: usize, ny: usize) -> Vec<[f64; 2]> {
    assert!(nx > 1 && ny > 1);
    let step_x = 2.0 / (nx - 1) as f64;
    let step_y = 2.0 / (ny - 1) as f64;
    (0..ny)
        .cartesian_product(0..nx)
        .map(|(i, j)| [-1.0 + step_x * j as f64, -1.0 + step_y * i as f64])
        .collect()
}

pub fn random_positions(n: usize, rng: &mut impl Rng) -> Vec<[f64; 2]> {
    (0..n)
        .map(|_| [rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)])
        .collect()
}

/// Star with the given Gaussian parameters and a random centroid offset
///
/// Pixel weights are the inverse noise variance, or unity for noiseless stars.
pub fn gaussian_star(
    params: &[f64],
    field_pos: [f64; 2],
    noise: f64,
    rng: &mut impl Rng,
) -> StarArrays {
    let geometry = StampGeometry::centered(STAMP_SIZE, Jacobian::pixel_scale(PIXEL_SCALE));
    let center = [
        rng.random_range(-MAX_OFFSET..MAX_OFFSET),
        rng.random_range(-MAX_OFFSET..MAX_OFFSET),
    ];
    let mut image = Model::gaussian().draw(params, FLUX, center, &geometry);
    let weight = if noise > 0.0 {
        image.mapv_inplace(|x| x + noise * rng.sample::<f64, _>(StandardNormal));
        noise.powi(-2)
    } else {
        1.0
    };
    StarArrays {
        image,
        weight: Array2::from_elem(geometry.shape, weight),
        image_pos: geometry.image_pos,
        field_pos,
        pixel_scale: PIXEL_SCALE,
        params: params.to_vec(),
        flux: FLUX,
        center,
    }
}

/// Catalog of stars following [linear_field]
pub fn gaussian_catalog(positions: &[[f64; 2]], noise: f64, seed: u64) -> Vec<StarArrays> {
    let mut rng = StdRng::seed_from_u64(seed);
    positions
        .iter()
        .map(|&p| gaussian_star(&linear_field(p), p, noise, &mut rng))
        .collect()
}
