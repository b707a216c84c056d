use crate::types::Position;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Convex hull of the training positions
///
/// Predictions outside of the hull are extrapolations. Vertices are kept in counter-clockwise
/// order, degenerate hulls of one or two vertices are a point or a segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingDomain {
    vertices: Vec<Position>,
    /// Absolute tolerance of containment tests
    tolerance: f64,
}

#[inline]
fn cross(o: Position, a: Position, b: Position) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Closest point of segment `[a, b]` to `p`
fn project_to_segment(p: Position, a: Position, b: Position) -> Position {
    let ab = [b[0] - a[0], b[1] - a[1]];
    let len_sq = ab[0] * ab[0] + ab[1] * ab[1];
    if len_sq == 0.0 {
        return a;
    }
    let t = (((p[0] - a[0]) * ab[0] + (p[1] - a[1]) * ab[1]) / len_sq).clamp(0.0, 1.0);
    [a[0] + t * ab[0], a[1] + t * ab[1]]
}

#[inline]
fn dist_sq(a: Position, b: Position) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

impl TrainingDomain {
    /// Andrew's monotone chain
    pub fn new(positions: &[Position]) -> Self {
        let points = positions
            .iter()
            .copied()
            .sorted_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])))
            .dedup()
            .collect_vec();
        let span = points
            .iter()
            .tuple_combinations()
            .map(|(&a, &b)| dist_sq(a, b))
            .fold(0.0, f64::max)
            .sqrt();
        let scale = points
            .iter()
            .flat_map(|p| p.iter())
            .fold(span, |acc, x| acc.max(x.abs()));
        let tolerance = 1e-9 * scale.max(1.0);

        if points.len() < 3 {
            return Self {
                vertices: points,
                tolerance,
            };
        }

        let mut lower: Vec<Position> = Vec::with_capacity(points.len());
        for &p in &points {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0
            {
                lower.pop();
            }
            lower.push(p);
        }
        let mut upper: Vec<Position> = Vec::with_capacity(points.len());
        for &p in points.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0
            {
                upper.pop();
            }
            upper.push(p);
        }
        lower.pop();
        upper.pop();
        lower.extend(upper);
        Self {
            vertices: lower,
            tolerance,
        }
    }

    pub fn vertices(&self) -> &[Position] {
        &self.vertices
    }

    pub fn contains(&self, p: Position) -> bool {
        match self.vertices.len() {
            0 => false,
            1 | 2 => dist_sq(self.project(p), p) <= self.tolerance.powi(2),
            _ => self
                .vertices
                .iter()
                .circular_tuple_windows()
                .all(|(&a, &b)| {
                    let len = dist_sq(a, b).sqrt();
                    cross(a, b, p) >= -self.tolerance * len
                }),
        }
    }

    /// Closest point of the domain, `p` itself if it is inside
    pub fn project(&self, p: Position) -> Position {
        match self.vertices.len() {
            0 => p,
            1 => self.vertices[0],
            2 => project_to_segment(p, self.vertices[0], self.vertices[1]),
            _ => {
                if self.contains(p) {
                    return p;
                }
                self.vertices
                    .iter()
                    .circular_tuple_windows()
                    .map(|(&a, &b)| project_to_segment(p, a, b))
                    .min_by(|&x, &y| dist_sq(x, p).total_cmp(&dist_sq(y, p)))
                    .unwrap_or(p)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn square_with_inner_points() {
        let positions = [
            [0.0, 0.0],
            [1.0, 0.0],
            [0.5, 0.5],
            [1.0, 1.0],
            [0.0, 1.0],
            [0.2, 0.7],
            [0.5, 0.0],
        ];
        let domain = TrainingDomain::new(&positions);
        assert_eq!(
            domain.vertices(),
            &[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]
        );
        assert!(domain.contains([0.5, 0.5]));
        assert!(domain.contains([1.0, 0.3]));
        assert!(!domain.contains([1.1, 0.3]));
        assert!(!domain.contains([-0.5, -0.5]));
        assert_abs_diff_eq!(&domain.project([1.5, 0.3])[..], &[1.0, 0.3][..]);
        assert_abs_diff_eq!(&domain.project([-1.0, -2.0])[..], &[0.0, 0.0][..]);
        assert_eq!(domain.project([0.3, 0.4]), [0.3, 0.4]);
    }

    #[test]
    fn collinear_points() {
        let domain = TrainingDomain::new(&[[0.0, 0.0], [2.0, 2.0], [1.0, 1.0]]);
        assert_eq!(domain.vertices().len(), 2);
        assert!(domain.contains([0.5, 0.5]));
        assert!(!domain.contains([0.5, 0.6]));
        assert_abs_diff_eq!(&domain.project([0.0, 2.0])[..], &[1.0, 1.0][..]);
    }

    #[test]
    fn single_point() {
        let domain = TrainingDomain::new(&[[3.0, 4.0], [3.0, 4.0]]);
        assert_eq!(domain.vertices(), &[[3.0, 4.0]]);
        assert!(domain.contains([3.0, 4.0]));
        assert!(!domain.contains([3.0, 4.1]));
        assert_eq!(domain.project([0.0, 0.0]), [3.0, 4.0]);
    }
}
