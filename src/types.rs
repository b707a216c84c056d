/// Two-dimensional coordinate: a field position or a world-coordinate offset
pub type Position = [f64; 2];

/// Indices of stars within the catalog passed to a session
pub type StarIndex = usize;
