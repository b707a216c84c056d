//! Adaptive second moments of a star stamp
//!
//! The weight function is an elliptical Gaussian which is iteratively matched to the light
//! profile, so for a Gaussian star the weight converges to the star itself. All quantities are
//! measured in world coordinates relative to the nominal stamp position and only weighted pixels
//! are used.

use crate::data::StarData;
use crate::error::FitError;
use crate::types::Position;

use itertools::Itertools;

const MAX_ITERATIONS: usize = 100;
const TOLERANCE: f64 = 1e-8;
/// Minimum number of weighted pixels for a second-moment measurement
pub(crate) const MIN_PIXELS: usize = 3;

/// Result of the adaptive-moment measurement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments {
    /// Total flux, assuming a Gaussian profile
    pub flux: f64,
    /// Centroid, world offset from the nominal stamp position
    pub center: Position,
    /// Size $\det(M)^{1/4}$
    pub sigma: f64,
    /// Reduced shear components
    pub g1: f64,
    pub g2: f64,
    /// Second moment matrix `[M_uu, M_uv, M_vv]`
    pub m: [f64; 3],
}

impl Moments {
    /// Convert a moment matrix to size and reduced shear
    fn from_matrix(flux: f64, center: Position, m: [f64; 3]) -> Result<Self, FitError> {
        let [muu, muv, mvv] = m;
        let det = muu * mvv - muv * muv;
        let trace = muu + mvv;
        if !(det > 0.0 && trace > 0.0) {
            return Err(FitError::Moments("moment matrix is not positive definite"));
        }
        let e1 = (muu - mvv) / trace;
        let e2 = 2.0 * muv / trace;
        let e_sq = e1 * e1 + e2 * e2;
        let factor = 1.0 / (1.0 + f64::sqrt(1.0 - e_sq.min(1.0)));
        Ok(Self {
            flux,
            center,
            sigma: det.powf(0.25),
            g1: e1 * factor,
            g2: e2 * factor,
            m,
        })
    }
}

/// Measure adaptive moments of a star
pub fn adaptive_moments(star: &StarData) -> Result<Moments, FitError> {
    let pixels = star
        .weighted_pixels()
        .map(|(pos, value, _)| (pos, value))
        .collect_vec();
    if pixels.is_empty() {
        return Err(FitError::NoWeightedPixels);
    }
    if pixels.len() < MIN_PIXELS {
        return Err(FitError::TooFewPixels {
            actual: pixels.len(),
            minimum: MIN_PIXELS,
        });
    }

    let pixel_area = star.jacobian().pixel_area();
    let (mut center, mut m) = starting_point(&pixels, pixel_area, star.center_hint());
    let max_size = {
        let (rows, cols) = star.geometry().shape;
        pixel_area * (rows.max(cols) as f64).powi(2)
    };

    for _ in 0..MAX_ITERATIONS {
        let [muu, muv, mvv] = m;
        let det = muu * mvv - muv * muv;
        // Inverse of the weight covariance
        let (iuu, iuv, ivv) = (mvv / det, -muv / det, muu / det);

        let mut a = 0.0;
        let mut b = [0.0; 2];
        let mut c = [0.0; 3];
        for &([u, v], value) in &pixels {
            let du = u - center[0];
            let dv = v - center[1];
            let rho2 = iuu * du * du + 2.0 * iuv * du * dv + ivv * dv * dv;
            let iw = value * f64::exp(-0.5 * rho2);
            a += iw;
            b[0] += iw * du;
            b[1] += iw * dv;
            c[0] += iw * du * du;
            c[1] += iw * du * dv;
            c[2] += iw * dv * dv;
        }
        if !(a > 0.0) {
            return Err(FitError::Moments("non-positive weighted flux"));
        }

        let dc = [b[0] / a, b[1] / a];
        let m_new = [
            2.0 * (c[0] / a - dc[0] * dc[0]),
            2.0 * (c[1] / a - dc[0] * dc[1]),
            2.0 * (c[2] / a - dc[1] * dc[1]),
        ];
        if !m_new.iter().all(|x| x.is_finite()) {
            return Err(FitError::NonFinite);
        }
        if m_new[0] * m_new[2] - m_new[1] * m_new[1] <= 0.0 || m_new[0] <= 0.0 {
            return Err(FitError::Moments("moment matrix is not positive definite"));
        }
        if m_new[0] + m_new[2] > max_size {
            return Err(FitError::Moments("size diverged"));
        }
        center = [center[0] + dc[0], center[1] + dc[1]];

        let scale = m[0] + m[2];
        let shift = (dc[0] * dc[0] + dc[1] * dc[1]) / scale;
        let change = m_new
            .iter()
            .zip(m.iter())
            .map(|(new, old)| (new - old).abs())
            .fold(0.0, f64::max)
            / scale;
        m = m_new;
        if shift < TOLERANCE * TOLERANCE && change < TOLERANCE {
            return Moments::from_matrix(2.0 * a, center, m);
        }
    }
    Err(FitError::Moments("adaptive moments did not converge"))
}

/// Unweighted centroid and second moments of positive pixels
fn starting_point(
    pixels: &[(Position, f64)],
    pixel_area: f64,
    center_hint: Option<Position>,
) -> (Position, [f64; 3]) {
    let positive = || pixels.iter().filter(|(_, value)| *value > 0.0);
    let total: f64 = positive().map(|(_, value)| value).sum();
    let min_var = pixel_area;
    if !(total > 0.0) {
        return (center_hint.unwrap_or([0.0, 0.0]), [min_var, 0.0, min_var]);
    }
    let center = center_hint.unwrap_or_else(|| {
        let (su, sv) = positive().fold((0.0, 0.0), |(su, sv), ([u, v], value)| {
            (su + value * u, sv + value * v)
        });
        [su / total, sv / total]
    });
    let spread: f64 = positive()
        .map(|([u, v], value)| value * ((u - center[0]).powi(2) + (v - center[1]).powi(2)))
        .sum();
    // Unweighted moments of noisy stamps are dominated by the wings, start from a round weight
    let var = (0.5 * spread / total).max(min_var);
    (center, [var, 0.0, var])
}
