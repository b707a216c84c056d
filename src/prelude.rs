pub use crate::interp::{FittedStateTrait, InterpolatorTrait};
pub use crate::model::{ModelTrait, RadialProfile};
