mod star_data;
pub use star_data::{Jacobian, StampGeometry, StarData};

mod star_fit;
pub use star_fit::{Residual, StarFit};
