pub(super) fn within_bounds(x: &[f64], lower: &[f64], upper: &[f64]) -> bool {
    x.iter()
        .zip(lower.iter().zip(upper.iter()))
        .all(|(x, (lower, upper))| lower <= x && x <= upper)
}

/// Project `x` onto the box in place
pub(super) fn clamp_to_bounds(x: &mut [f64], lower: &[f64], upper: &[f64]) {
    for (x, (&lower, &upper)) in x.iter_mut().zip(lower.iter().zip(upper.iter())) {
        *x = x.clamp(lower, upper);
    }
}
