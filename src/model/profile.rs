use crate::data::{Residual, StampGeometry, StarData, StarFit};
use crate::error::FitError;
use crate::model::ModelTrait;
use crate::moments::{Moments, adaptive_moments};
use crate::nl_fit::{CurveFitTrait, LeastSquaresProblem, LmCurveFit};
use crate::types::Position;

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Length of the full profile vector `[flux, du, dv, scale, g1, g2]`
pub(crate) const FULL_NPARAMS: usize = 6;
const FLUX: usize = 0;
const DU: usize = 1;
const DV: usize = 2;
const SCALE: usize = 3;
const G1: usize = 4;
const G2: usize = 5;

const ALL_PARAMS: [usize; FULL_NPARAMS] = [FLUX, DU, DV, SCALE, G1, G2];
const FLUX_CENTER: [usize; 3] = [FLUX, DU, DV];

/// Bound of each reduced shear component
pub const MAX_SHEAR: f64 = 0.7;
/// Lower bound of scale in units of the moment size
const SCALE_MIN: f64 = 1e-3;
/// Sub-pixel grid is SUBPIXELS x SUBPIXELS
const SUBPIXELS: usize = 4;
const FASTFIT_ITERATIONS: usize = 5;

const CENTERED_NAMES: [&str; 3] = ["scale", "g1", "g2"];
const FREE_CENTER_NAMES: [&str; 5] = ["du", "dv", "scale", "g1", "g2"];

/// Options shared by every radial profile model
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProfileOptions {
    /// Match adaptive moments instead of running a full least-squares fit
    #[serde(default = "ProfileOptions::default_fastfit")]
    pub fastfit: bool,
    /// Keep the centroid as a per-star nuisance parameter instead of interpolating it
    #[serde(default = "ProfileOptions::default_force_model_center")]
    pub force_model_center: bool,
    /// Integrate the profile over pixel area instead of sampling it at pixel centers
    #[serde(default = "ProfileOptions::default_include_pixel")]
    pub include_pixel: bool,
}

impl ProfileOptions {
    #[inline]
    pub fn default_fastfit() -> bool {
        false
    }

    #[inline]
    pub fn default_force_model_center() -> bool {
        true
    }

    #[inline]
    pub fn default_include_pixel() -> bool {
        true
    }

    pub fn with_fastfit(mut self, fastfit: bool) -> Self {
        self.fastfit = fastfit;
        self
    }

    pub fn with_force_model_center(mut self, force_model_center: bool) -> Self {
        self.force_model_center = force_model_center;
        self
    }

    pub fn with_include_pixel(mut self, include_pixel: bool) -> Self {
        self.include_pixel = include_pixel;
        self
    }

    fn nparams(&self) -> usize {
        self.param_names().len()
    }

    fn param_names(&self) -> &'static [&'static str] {
        if self.force_model_center {
            &CENTERED_NAMES
        } else {
            &FREE_CENTER_NAMES
        }
    }

    /// Compose the full profile vector from the interpolated parameters and per-star values
    fn full_params(&self, params: &[f64], flux: f64, center: Position) -> [f64; FULL_NPARAMS] {
        assert_eq!(
            params.len(),
            self.nparams(),
            "wrong number of model parameters"
        );
        if self.force_model_center {
            [flux, center[0], center[1], params[0], params[1], params[2]]
        } else {
            [
                flux,
                params[0] + center[0],
                params[1] + center[1],
                params[2],
                params[3],
                params[4],
            ]
        }
    }

    /// Split the full profile vector into `(params, flux, center)`
    fn split(&self, full: &[f64; FULL_NPARAMS]) -> (Vec<f64>, f64, Position) {
        if self.force_model_center {
            (
                full[SCALE..].to_vec(),
                full[FLUX],
                [full[DU], full[DV]],
            )
        } else {
            (full[DU..].to_vec(), full[FLUX], [0.0, 0.0])
        }
    }
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            fastfit: Self::default_fastfit(),
            force_model_center: Self::default_force_model_center(),
            include_pixel: Self::default_include_pixel(),
        }
    }
}

/// Unit-flux fiducial profile which is dilated, sheared, shifted and scaled by flux
///
/// The surface brightness at world offset $(u, v)$ is
/// $$
/// I(u, v) = \frac{F}{s^2} f(q),\quad q = \frac{a u'^2 + 2 b u' v' + c v'^2}{s^2},
/// $$
/// where $u' = u - \delta u$, $v' = v - \delta v$ and the area-preserving shear matrix is
/// $$
/// a = \frac{1 - 2 g_1 + g^2}{1 - g^2},\quad b = \frac{-2 g_2}{1 - g^2},\quad c = \frac{1 + 2 g_1 + g^2}{1 - g^2}.
/// $$
pub trait RadialProfile {
    fn options(&self) -> &ProfileOptions;

    /// Fiducial profile $f(q)$ of squared radius and its derivative $df/dq$, normalized to
    /// $\int f(r^2) d^2 r = 1$
    fn value_dq(&self, q: f64) -> (f64, f64);

    /// Approximate ratio of the profile scale to the adaptive-moment size of a round profile
    fn scale_per_sigma(&self) -> f64;
}

/// Shear matrix elements and their derivatives with respect to `g1` and `g2`
#[derive(Clone, Copy)]
struct Distortion {
    a: f64,
    b: f64,
    c: f64,
    da: [f64; 2],
    db: [f64; 2],
    dc: [f64; 2],
}

impl Distortion {
    fn new(g1: f64, g2: f64) -> Self {
        let g_sq = g1 * g1 + g2 * g2;
        let d = 1.0 - g_sq;
        let num_a = 1.0 - 2.0 * g1 + g_sq;
        let num_b = -2.0 * g2;
        let num_c = 1.0 + 2.0 * g1 + g_sq;
        // d(num / d) / dg_k, d(d) / dg_k = -2 g_k
        let deriv = |dnum: f64, num: f64, g: f64| (dnum * d + num * 2.0 * g) / (d * d);
        Self {
            a: num_a / d,
            b: num_b / d,
            c: num_c / d,
            da: [deriv(2.0 * g1 - 2.0, num_a, g1), deriv(2.0 * g2, num_a, g2)],
            db: [deriv(0.0, num_b, g1), deriv(-2.0, num_b, g2)],
            dc: [deriv(2.0 * g1 + 2.0, num_c, g1), deriv(2.0 * g2, num_c, g2)],
        }
    }
}

/// Profile with fixed full parameters, evaluated on world offsets
struct Evaluator<'a, P: ?Sized> {
    profile: &'a P,
    full: [f64; FULL_NPARAMS],
    distortion: Distortion,
}

impl<'a, P: RadialProfile + ?Sized> Evaluator<'a, P> {
    fn new(profile: &'a P, full: [f64; FULL_NPARAMS]) -> Self {
        Self {
            profile,
            full,
            distortion: Distortion::new(full[G1], full[G2]),
        }
    }

    #[inline]
    fn value(&self, u: f64, v: f64) -> f64 {
        let [flux, du, dv, scale, _, _] = self.full;
        let Distortion { a, b, c, .. } = self.distortion;
        let (u, v) = (u - du, v - dv);
        let s2 = scale * scale;
        let q = (a * u * u + 2.0 * b * u * v + c * v * v) / s2;
        flux / s2 * self.profile.value_dq(q).0
    }

    #[inline]
    fn value_grad(&self, u: f64, v: f64, grad: &mut [f64; FULL_NPARAMS]) -> f64 {
        let [flux, du, dv, scale, _, _] = self.full;
        let Distortion {
            a,
            b,
            c,
            da,
            db,
            dc,
        } = self.distortion;
        let (u, v) = (u - du, v - dv);
        let s2 = scale * scale;
        let q = (a * u * u + 2.0 * b * u * v + c * v * v) / s2;
        let (f, df) = self.profile.value_dq(q);
        let norm = flux / s2;
        let dq = norm * df / s2;
        grad[FLUX] = f / s2;
        grad[DU] = -dq * 2.0 * (a * u + b * v);
        grad[DV] = -dq * 2.0 * (b * u + c * v);
        grad[SCALE] = -2.0 * flux / (s2 * scale) * (f + q * df);
        for k in 0..2 {
            grad[G1 + k] = dq * (da[k] * u * u + 2.0 * db[k] * u * v + dc[k] * v * v);
        }
        norm * f
    }
}

/// World offsets of pixel samples relative to the pixel center, and the weight of every sample
struct PixelSampling {
    offsets: Vec<Position>,
    weight: f64,
}

impl PixelSampling {
    fn new(geometry: &StampGeometry, include_pixel: bool) -> Self {
        let area = geometry.jacobian.pixel_area();
        if !include_pixel {
            return Self {
                offsets: vec![[0.0, 0.0]],
                weight: area,
            };
        }
        let step = 1.0 / SUBPIXELS as f64;
        let grid = (0..SUBPIXELS).map(|k| (k as f64 + 0.5) * step - 0.5);
        let offsets = itertools::iproduct!(grid.clone(), grid)
            .map(|(dy, dx)| geometry.jacobian.to_world(dx, dy))
            .collect::<Vec<_>>();
        Self {
            weight: area / offsets.len() as f64,
            offsets,
        }
    }

    fn pixel_value<P: RadialProfile + ?Sized>(&self, eval: &Evaluator<P>, [u, v]: Position) -> f64 {
        self.weight
            * self
                .offsets
                .iter()
                .map(|[ou, ov]| eval.value(u + ou, v + ov))
                .sum::<f64>()
    }

    fn pixel_value_grad<P: RadialProfile + ?Sized>(
        &self,
        eval: &Evaluator<P>,
        [u, v]: Position,
        grad: &mut [f64; FULL_NPARAMS],
    ) -> f64 {
        let mut sample_grad = [0.0; FULL_NPARAMS];
        *grad = [0.0; FULL_NPARAMS];
        let mut value = 0.0;
        for [ou, ov] in &self.offsets {
            value += eval.value_grad(u + ou, v + ov, &mut sample_grad);
            for (g, s) in grad.iter_mut().zip(sample_grad.iter()) {
                *g += s;
            }
        }
        for g in grad.iter_mut() {
            *g *= self.weight;
        }
        value * self.weight
    }
}

fn render<P: RadialProfile + ?Sized>(
    profile: &P,
    full: [f64; FULL_NPARAMS],
    geometry: &StampGeometry,
) -> Array2<f64> {
    let eval = Evaluator::new(profile, full);
    let sampling = PixelSampling::new(geometry, profile.options().include_pixel);
    Array2::from_shape_fn(geometry.shape, |(row, col)| {
        sampling.pixel_value(&eval, geometry.world_offset(row, col))
    })
}

/// Least-squares problem over a subset of the full profile vector
///
/// Optimizer parameters are `full[free[i]] / norm[free[i]]`, the rest of the full vector is
/// fixed to `template`.
struct ProfileProblem<'a, P: ?Sized> {
    profile: &'a P,
    /// Weighted pixels as (world offset, value, sqrt(weight))
    pixels: Vec<(Position, f64, f64)>,
    sampling: PixelSampling,
    template: [f64; FULL_NPARAMS],
    free: &'static [usize],
    norm: [f64; FULL_NPARAMS],
}

impl<'a, P: RadialProfile + ?Sized> ProfileProblem<'a, P> {
    fn new(
        profile: &'a P,
        star: &StarData,
        template: [f64; FULL_NPARAMS],
        free: &'static [usize],
        norm: [f64; FULL_NPARAMS],
    ) -> Self {
        Self {
            profile,
            pixels: star
                .weighted_pixels()
                .map(|(pos, value, w)| (pos, value, w.sqrt()))
                .collect(),
            sampling: PixelSampling::new(star.geometry(), profile.options().include_pixel),
            template,
            free,
            norm,
        }
    }

    fn to_internal(&self, full: &[f64; FULL_NPARAMS]) -> Vec<f64> {
        self.free.iter().map(|&k| full[k] / self.norm[k]).collect()
    }

    fn to_full(&self, x: &[f64]) -> [f64; FULL_NPARAMS] {
        let mut full = self.template;
        for (&k, &x) in self.free.iter().zip(x.iter()) {
            full[k] = x * self.norm[k];
        }
        full
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.free
            .iter()
            .map(|&k| match k {
                FLUX => (0.0, f64::INFINITY),
                SCALE => (SCALE_MIN, f64::INFINITY),
                G1 | G2 => (-MAX_SHEAR, MAX_SHEAR),
                _ => (f64::NEG_INFINITY, f64::INFINITY),
            })
            .unzip()
    }
}

impl<P: RadialProfile + ?Sized> LeastSquaresProblem for ProfileProblem<'_, P> {
    fn ndata(&self) -> usize {
        self.pixels.len()
    }

    fn residuals(&self, x: &[f64], residuals: &mut DVector<f64>) {
        let eval = Evaluator::new(self.profile, self.to_full(x));
        for (r, &(pos, value, sqrt_w)) in residuals.iter_mut().zip(self.pixels.iter()) {
            *r = sqrt_w * (value - self.sampling.pixel_value(&eval, pos));
        }
    }

    fn residuals_jacobian(
        &self,
        x: &[f64],
        residuals: &mut DVector<f64>,
        jacobian: &mut DMatrix<f64>,
    ) {
        let eval = Evaluator::new(self.profile, self.to_full(x));
        let mut grad = [0.0; FULL_NPARAMS];
        for (i, &(pos, value, sqrt_w)) in self.pixels.iter().enumerate() {
            let model = self.sampling.pixel_value_grad(&eval, pos, &mut grad);
            residuals[i] = sqrt_w * (value - model);
            for (j, &k) in self.free.iter().enumerate() {
                jacobian[(i, j)] = -sqrt_w * grad[k] * self.norm[k];
            }
        }
    }
}

fn check_physical(full: &[f64; FULL_NPARAMS]) -> Result<(), FitError> {
    if !full.iter().all(|x| x.is_finite()) {
        return Err(FitError::NonFinite);
    }
    if full[FLUX] <= 0.0 {
        return Err(FitError::NonPhysical {
            name: "flux",
            value: full[FLUX],
        });
    }
    if full[SCALE] <= 0.0 {
        return Err(FitError::NonPhysical {
            name: "scale",
            value: full[SCALE],
        });
    }
    for (name, k) in [("g1", G1), ("g2", G2)] {
        if full[k].abs() > MAX_SHEAR {
            return Err(FitError::NonPhysical {
                name,
                value: full[k],
            });
        }
    }
    Ok(())
}

/// Fitting routines shared by every [RadialProfile]
trait ProfileFit: RadialProfile {
    /// Starting point from adaptive moments
    fn moments_start(&self, star: &StarData) -> Result<(Moments, [f64; FULL_NPARAMS]), FitError> {
        let moments = adaptive_moments(star)?;
        let flux = star
            .flux_hint()
            .filter(|_| !(moments.flux > 0.0))
            .unwrap_or(moments.flux);
        let full = [
            flux,
            moments.center[0],
            moments.center[1],
            moments.sigma * self.scale_per_sigma(),
            moments.g1.clamp(-MAX_SHEAR, MAX_SHEAR),
            moments.g2.clamp(-MAX_SHEAR, MAX_SHEAR),
        ];
        Ok((moments, full))
    }

    fn finish(&self, star: &StarData, full: [f64; FULL_NPARAMS]) -> Result<StarFit, FitError> {
        check_physical(&full)?;
        let options = self.options();
        let chisq = star.chisq(&render(self, full, star.geometry()));
        if !chisq.is_finite() {
            return Err(FitError::NonFinite);
        }
        let dof = star.n_weighted() as i64 - options.nparams() as i64;
        let (params, flux, center) = options.split(&full);
        Ok(StarFit::new(params, flux, center, chisq, dof))
    }

    fn moment_fit(
        &self,
        star: &StarData,
        target: &Moments,
        mut full: [f64; FULL_NPARAMS],
    ) -> Result<[f64; FULL_NPARAMS], FitError> {
        for _ in 0..FASTFIT_ITERATIONS {
            let image = render(self, full, star.geometry());
            let model_star = star.with_image(image).map_err(|_| FitError::NonFinite)?;
            let model = adaptive_moments(&model_star)?;
            full[FLUX] *= target.flux / model.flux;
            full[DU] += target.center[0] - model.center[0];
            full[DV] += target.center[1] - model.center[1];
            full[SCALE] *= target.sigma / model.sigma;
            full[G1] = (full[G1] + target.g1 - model.g1).clamp(-MAX_SHEAR, MAX_SHEAR);
            full[G2] = (full[G2] + target.g2 - model.g2).clamp(-MAX_SHEAR, MAX_SHEAR);
        }
        Ok(full)
    }

    fn lm_fit(
        &self,
        star: &StarData,
        moments: &Moments,
        start: [f64; FULL_NPARAMS],
        max_iterations: usize,
    ) -> Result<[f64; FULL_NPARAMS], FitError> {
        let s0 = moments.sigma;
        let norm = [start[FLUX], s0, s0, s0, 1.0, 1.0];
        let problem = ProfileProblem::new(self, star, start, &ALL_PARAMS, norm);
        let (lower, upper) = problem.bounds();
        let result = LmCurveFit::new(max_iterations).curve_fit(
            &problem,
            &problem.to_internal(&start),
            (&lower, &upper),
        );
        if !result.success {
            return Err(FitError::NotConverged {
                iterations: result.iterations,
            });
        }
        Ok(problem.to_full(&result.x))
    }

    fn try_fit(&self, star: &StarData, max_iterations: usize) -> Result<StarFit, FitError> {
        let n = star.n_weighted();
        if n == 0 {
            return Err(FitError::NoWeightedPixels);
        }
        let minimum = FULL_NPARAMS + 1;
        if n < minimum {
            return Err(FitError::TooFewPixels { actual: n, minimum });
        }
        let (moments, start) = self.moments_start(star)?;
        let full = if self.options().fastfit {
            self.moment_fit(star, &moments, start)?
        } else {
            self.lm_fit(star, &moments, start, max_iterations)?
        };
        self.finish(star, full)
    }
}

impl<P: RadialProfile + ?Sized> ProfileFit for P {}

impl<P: RadialProfile> ModelTrait for P {
    fn nparams(&self) -> usize {
        self.options().nparams()
    }

    fn param_names(&self) -> &'static [&'static str] {
        self.options().param_names()
    }

    fn initialize(&self, star: &StarData) -> Result<StarFit, FitError> {
        if star.n_weighted() == 0 {
            return Err(FitError::NoWeightedPixels);
        }
        let (_, full) = self.moments_start(star)?;
        self.finish(star, full)
    }

    fn fit(&self, star: &StarData, max_iterations: usize) -> StarFit {
        match self.try_fit(star, max_iterations) {
            Ok(fit) => {
                log::trace!(
                    "star at {:?} fitted: chisq = {}, dof = {}",
                    star.field_pos(),
                    fit.chisq,
                    fit.dof
                );
                fit
            }
            Err(error) => {
                log::trace!("fit of star at {:?} failed: {error}", star.field_pos());
                StarFit::failed(self.nparams(), error)
            }
        }
    }

    fn draw(
        &self,
        params: &[f64],
        flux: f64,
        center: Position,
        geometry: &StampGeometry,
    ) -> Array2<f64> {
        let full = self.options().full_params(params, flux, center);
        render(self, full, geometry)
    }

    fn reflux(
        &self,
        star: &StarData,
        params: &[f64],
        start: &StarFit,
        fit_center: bool,
        max_iterations: usize,
    ) -> Result<Residual, FitError> {
        let options = self.options();
        let fit_center = fit_center && options.force_model_center;
        let nfree = if fit_center { FLUX_CENTER.len() } else { 1 };
        let n = star.n_weighted();
        if n == 0 {
            return Err(FitError::NoWeightedPixels);
        }
        if n <= nfree {
            return Err(FitError::TooFewPixels {
                actual: n,
                minimum: nfree + 1,
            });
        }
        let flux0 = Some(start.flux)
            .filter(|x| x.is_finite() && *x > 0.0)
            .unwrap_or(1.0);
        let center0 = if start.center.iter().all(|x| x.is_finite()) {
            start.center
        } else {
            [0.0, 0.0]
        };
        let mut full = options.full_params(params, flux0, center0);

        if fit_center {
            let s0 = full[SCALE].abs().max(f64::MIN_POSITIVE);
            let norm = [flux0, s0, s0, 1.0, 1.0, 1.0];
            let problem = ProfileProblem::new(self, star, full, &FLUX_CENTER, norm);
            let (lower, upper) = problem.bounds();
            let result = LmCurveFit::new(max_iterations).curve_fit(
                &problem,
                &problem.to_internal(&full),
                (&lower, &upper),
            );
            if !result.success {
                return Err(FitError::NotConverged {
                    iterations: result.iterations,
                });
            }
            full = problem.to_full(&result.x);
        } else {
            // Linear least squares for flux of the unit-flux model
            full[FLUX] = 1.0;
            let unit = render(self, full, star.geometry());
            let (num, denom) = star
                .image()
                .iter()
                .zip(star.weight().iter())
                .zip(unit.iter())
                .fold((0.0, 0.0), |(num, denom), ((&i, &w), &m)| {
                    (num + w * i * m, denom + w * m * m)
                });
            if !(denom > 0.0) {
                return Err(FitError::NonFinite);
            }
            full[FLUX] = num / denom;
        }
        check_physical(&full)?;

        let chisq = star.chisq(&render(self, full, star.geometry()));
        if !chisq.is_finite() {
            return Err(FitError::NonFinite);
        }
        let (_, flux, center) = options.split(&full);
        Ok(Residual {
            flux,
            center,
            chisq,
            dof: n as i64 - nfree as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    struct Gauss(ProfileOptions);

    impl RadialProfile for Gauss {
        fn options(&self) -> &ProfileOptions {
            &self.0
        }

        fn value_dq(&self, q: f64) -> (f64, f64) {
            let f = f64::exp(-0.5 * q) / (2.0 * std::f64::consts::PI);
            (f, -0.5 * f)
        }

        fn scale_per_sigma(&self) -> f64 {
            1.0
        }
    }

    #[test]
    fn distortion_is_area_preserving() {
        for (g1, g2) in [(0.0, 0.0), (0.3, -0.1), (-0.5, 0.4)] {
            let Distortion { a, b, c, .. } = Distortion::new(g1, g2);
            assert_relative_eq!(a * c - b * b, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let profile = Gauss(ProfileOptions::default());
        let full = [2.0, 0.1, -0.2, 1.3, 0.15, -0.25];
        let eval = Evaluator::new(&profile, full);
        let (u, v) = (0.7, 0.4);
        let mut grad = [0.0; FULL_NPARAMS];
        let value = eval.value_grad(u, v, &mut grad);
        assert_relative_eq!(value, eval.value(u, v), epsilon = 1e-15);
        for k in 0..FULL_NPARAMS {
            let h = 1e-6;
            let mut plus = full;
            plus[k] += h;
            let mut minus = full;
            minus[k] -= h;
            let numeric = (Evaluator::new(&profile, plus).value(u, v)
                - Evaluator::new(&profile, minus).value(u, v))
                / (2.0 * h);
            assert_relative_eq!(grad[k], numeric, epsilon = 1e-7, max_relative = 1e-5);
        }
    }

    #[test]
    fn rendered_flux() {
        let profile = Gauss(ProfileOptions::default());
        let geometry = StampGeometry::centered(81, crate::data::Jacobian::pixel_scale(0.25));
        let image = render(&profile, [100.0, 0.0, 0.0, 1.0, 0.2, 0.1], &geometry);
        assert_relative_eq!(image.sum(), 100.0, max_relative = 1e-6);
    }

    #[test]
    fn split_and_compose() {
        let options = ProfileOptions::default().with_force_model_center(false);
        let full = options.full_params(&[0.1, 0.2, 1.0, 0.0, 0.05], 3.0, [0.0, 0.0]);
        assert_eq!(full, [3.0, 0.1, 0.2, 1.0, 0.0, 0.05]);
        let (params, flux, center) = options.split(&full);
        assert_eq!(params, vec![0.1, 0.2, 1.0, 0.0, 0.05]);
        assert_eq!(flux, 3.0);
        assert_eq!(center, [0.0, 0.0]);
    }
}
