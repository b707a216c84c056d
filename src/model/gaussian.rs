use crate::model::profile::{ProfileOptions, RadialProfile};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

macro_const! {
    const DOC: &str = r"
Elliptical Gaussian profile

$$
f(r^2) = \frac{1}{2\pi} \exp\left(-\frac{r^2}{2}\right),
$$
so `scale` is the standard deviation of the round profile.

- Interpolated parameters: `scale`, `g1`, `g2` (`du`, `dv` first unless the centroid is forced)
";
}

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Gaussian {
    #[serde(flatten)]
    pub options: ProfileOptions,
}

impl Gaussian {
    pub fn new(options: ProfileOptions) -> Self {
        Self { options }
    }

    pub fn doc() -> &'static str {
        DOC
    }
}

impl RadialProfile for Gaussian {
    fn options(&self) -> &ProfileOptions {
        &self.options
    }

    #[inline]
    fn value_dq(&self, q: f64) -> (f64, f64) {
        let f = f64::exp(-0.5 * q) / (2.0 * PI);
        (f, -0.5 * f)
    }

    fn scale_per_sigma(&self) -> f64 {
        1.0
    }
}
