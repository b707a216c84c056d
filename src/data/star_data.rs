use crate::error::StarDataError;
use crate::types::Position;

use ndarray::{Array2, ArrayView2, Zip};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Local linear pixel-to-world transformation around a star
///
/// A pixel offset `(dx, dy)` maps to a world offset `(du, dv)`:
///
/// ```text
/// du = dudx * dx + dudy * dy
/// dv = dvdx * dx + dvdy * dy
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Jacobian {
    pub dudx: f64,
    pub dudy: f64,
    pub dvdx: f64,
    pub dvdy: f64,
}

impl Jacobian {
    pub fn new(dudx: f64, dudy: f64, dvdx: f64, dvdy: f64) -> Self {
        Self {
            dudx,
            dudy,
            dvdx,
            dvdy,
        }
    }

    /// Square pixels of the given size without rotation
    pub fn pixel_scale(scale: f64) -> Self {
        Self::new(scale, 0.0, 0.0, scale)
    }

    pub fn det(&self) -> f64 {
        self.dudx * self.dvdy - self.dudy * self.dvdx
    }

    /// Solid angle of a single pixel in world units
    pub fn pixel_area(&self) -> f64 {
        self.det().abs()
    }

    #[inline]
    pub fn to_world(&self, dx: f64, dy: f64) -> Position {
        [
            self.dudx * dx + self.dudy * dy,
            self.dvdx * dx + self.dvdy * dy,
        ]
    }

    /// Inverse transformation, world offset to pixel offset
    #[inline]
    pub fn to_pixel(&self, du: f64, dv: f64) -> [f64; 2] {
        let det = self.det();
        [
            (self.dvdy * du - self.dudy * dv) / det,
            (-self.dvdx * du + self.dudx * dv) / det,
        ]
    }
}

impl Default for Jacobian {
    fn default() -> Self {
        Self::pixel_scale(1.0)
    }
}

/// Everything required to render a model onto a stamp
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StampGeometry {
    /// `(rows, columns)` of the stamp
    pub shape: (usize, usize),
    /// Pixel position which corresponds to zero world offset
    pub image_pos: [f64; 2],
    pub jacobian: Jacobian,
}

impl StampGeometry {
    pub fn new(shape: (usize, usize), image_pos: [f64; 2], jacobian: Jacobian) -> Self {
        Self {
            shape,
            image_pos,
            jacobian,
        }
    }

    /// Geometry of a square stamp centered on the middle pixel (or pixel corner for even sizes)
    pub fn centered(size: usize, jacobian: Jacobian) -> Self {
        let c = 0.5 * (size as f64 - 1.0);
        Self::new((size, size), [c, c], jacobian)
    }

    /// World offset of the given pixel center from `image_pos`
    #[inline]
    pub fn world_offset(&self, row: usize, col: usize) -> Position {
        self.jacobian.to_world(
            col as f64 - self.image_pos[0],
            row as f64 - self.image_pos[1],
        )
    }
}

/// Observed star: pixel stamp, weight map and its place in the field of view
///
/// The object is immutable after construction, models and interpolators only read it. Pixels
/// with zero weight are masked and never enter fits or statistics.
#[derive(Clone, Debug)]
pub struct StarData {
    image: Array2<f64>,
    weight: Array2<f64>,
    geometry: StampGeometry,
    field_pos: Position,
    flux_hint: Option<f64>,
    center_hint: Option<Position>,
}

impl StarData {
    /// Construct [StarData] from a stamp and its weight map
    ///
    /// `image_pos` is the nominal pixel position of the star in the stamp, where the center of
    /// pixel `(row, column)` is at `x = column, y = row`. `field_pos` locates the star in the
    /// field of view, `jacobian` maps pixel offsets to the world coordinates the model is
    /// defined in.
    pub fn new(
        image: Array2<f64>,
        weight: Array2<f64>,
        image_pos: [f64; 2],
        field_pos: Position,
        jacobian: Jacobian,
    ) -> Result<Self, StarDataError> {
        if image.dim() != weight.dim() {
            return Err(StarDataError::ShapeMismatch {
                image: image.dim(),
                weight: weight.dim(),
            });
        }
        if image.is_empty() {
            return Err(StarDataError::EmptyStamp);
        }
        if !image.iter().all(|x| x.is_finite()) {
            return Err(StarDataError::NonFinite("image"));
        }
        if !weight.iter().all(|x| x.is_finite()) {
            return Err(StarDataError::NonFinite("weight"));
        }
        if weight.iter().any(|&w| w < 0.0) {
            return Err(StarDataError::NegativeWeight);
        }
        if !image_pos.iter().chain(field_pos.iter()).all(|x| x.is_finite()) {
            return Err(StarDataError::NonFinite("position"));
        }
        let det = jacobian.det();
        if !det.is_finite() || det == 0.0 {
            return Err(StarDataError::SingularJacobian);
        }
        Ok(Self {
            geometry: StampGeometry::new(image.dim(), image_pos, jacobian),
            image,
            weight,
            field_pos,
            flux_hint: None,
            center_hint: None,
        })
    }

    /// Empty stamp with unit weights, a template to draw models onto
    pub fn make_target(
        stamp_size: usize,
        field_pos: Position,
        jacobian: Jacobian,
    ) -> Result<Self, StarDataError> {
        let geometry = StampGeometry::centered(stamp_size, jacobian);
        Self::new(
            Array2::zeros(geometry.shape),
            Array2::ones(geometry.shape),
            geometry.image_pos,
            field_pos,
            jacobian,
        )
    }

    /// Attach a flux estimate from the catalog, used when adaptive moments are unreliable
    pub fn with_flux_hint(mut self, flux: f64) -> Self {
        self.flux_hint = Some(flux).filter(|x| x.is_finite() && *x > 0.0);
        self
    }

    /// Attach a centroid estimate in world offsets from `image_pos`
    pub fn with_center_hint(mut self, center: Position) -> Self {
        self.center_hint = Some(center).filter(|c| c.iter().all(|x| x.is_finite()));
        self
    }

    /// Copy of this star with the stamp replaced, used to measure rendered models
    pub fn with_image(&self, image: Array2<f64>) -> Result<Self, StarDataError> {
        let mut star = Self::new(
            image,
            self.weight.clone(),
            self.geometry.image_pos,
            self.field_pos,
            self.geometry.jacobian,
        )?;
        star.flux_hint = self.flux_hint;
        star.center_hint = self.center_hint;
        Ok(star)
    }

    pub fn image(&self) -> ArrayView2<'_, f64> {
        self.image.view()
    }

    pub fn weight(&self) -> ArrayView2<'_, f64> {
        self.weight.view()
    }

    pub fn geometry(&self) -> &StampGeometry {
        &self.geometry
    }

    pub fn image_pos(&self) -> [f64; 2] {
        self.geometry.image_pos
    }

    pub fn field_pos(&self) -> Position {
        self.field_pos
    }

    pub fn jacobian(&self) -> &Jacobian {
        &self.geometry.jacobian
    }

    pub fn flux_hint(&self) -> Option<f64> {
        self.flux_hint
    }

    pub fn center_hint(&self) -> Option<Position> {
        self.center_hint
    }

    /// Number of pixels with positive weight
    pub fn n_weighted(&self) -> usize {
        self.weight.iter().filter(|&&w| w > 0.0).count()
    }

    /// Weighted pixels as `(world offset, value, weight)`
    pub fn weighted_pixels(&self) -> impl Iterator<Item = (Position, f64, f64)> + '_ {
        self.image
            .indexed_iter()
            .zip(self.weight.iter())
            .filter(|(_, w)| **w > 0.0)
            .map(|(((row, col), &value), &w)| (self.geometry.world_offset(row, col), value, w))
    }

    /// $\chi^2 = \sum w (I - M)^2$ of a rendered model over weighted pixels
    pub fn chisq(&self, model: &Array2<f64>) -> f64 {
        assert_eq!(model.dim(), self.image.dim(), "model shape differs from stamp");
        Zip::from(&self.image)
            .and(&self.weight)
            .and(model)
            .fold(0.0, |acc, &i, &w, &m| {
                if w > 0.0 { acc + w * (i - m).powi(2) } else { acc }
            })
    }
}
