use crate::model::profile::{ProfileOptions, RadialProfile};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

macro_const! {
    const DOC: &str = r"
Elliptical Airy profile of an unobscured circular aperture

$$
f(r^2) = \frac{\pi}{4} \left(\frac{2 J_1(\pi r)}{\pi r}\right)^2,
$$
so `scale` is $\lambda / D$ of the round profile.

- Interpolated parameters: `scale`, `g1`, `g2` (`du`, `dv` first unless the centroid is forced)
";
}

/// Below this argument the series expansion of $J_1(x) / x$ is used
const SMALL_X: f64 = 1e-4;

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Airy {
    #[serde(flatten)]
    pub options: ProfileOptions,
}

impl Airy {
    pub fn new(options: ProfileOptions) -> Self {
        Self { options }
    }

    pub fn doc() -> &'static str {
        DOC
    }
}

impl RadialProfile for Airy {
    fn options(&self) -> &ProfileOptions {
        &self.options
    }

    fn value_dq(&self, q: f64) -> (f64, f64) {
        let x = PI * q.max(0.0).sqrt();
        if x < SMALL_X {
            return (0.25 * PI * (1.0 - 0.25 * x * x), -PI.powi(3) / 16.0);
        }
        let j1 = libm::j1(x);
        // h = 2 J1(x) / x, dh/dx = 2 (x J0 - 2 J1) / x^2
        let h = 2.0 * j1 / x;
        let dh = 2.0 * (x * libm::j0(x) - 2.0 * j1) / (x * x);
        // dx/dq = pi^2 / (2 x)
        (0.25 * PI * h * h, 0.25 * PI.powi(3) * h * dh / x)
    }

    fn scale_per_sigma(&self) -> f64 {
        // Gaussian with the same FWHM, 1.029 lambda/D
        2.3548 / 1.029
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    model_test!(
        airy,
        Airy::default(),
        [[1.0, 0.0, 0.0], [0.8, 0.1, -0.05], [1.2, -0.15, 0.1]],
    );

    #[test]
    fn small_argument_is_continuous() {
        let airy = Airy::default();
        let q = (SMALL_X / PI).powi(2);
        let (below, dbelow) = airy.value_dq(q * 0.99);
        let (above, dabove) = airy.value_dq(q * 1.01);
        assert_relative_eq!(below, above, max_relative = 1e-7);
        assert_relative_eq!(dbelow, dabove, max_relative = 1e-4);
    }

    #[test]
    fn derivative() {
        let airy = Airy::default();
        for q in [0.01, 0.3, 1.7, 5.0] {
            let h = 1e-6;
            let numeric = (airy.value_dq(q + h).0 - airy.value_dq(q - h).0) / (2.0 * h);
            assert_relative_eq!(airy.value_dq(q).1, numeric, epsilon = 1e-8, max_relative = 1e-5);
        }
    }

    #[test]
    fn first_dark_ring() {
        // First zero of J1 is at x = 3.8317, r = 1.2197 lambda/D
        let r = 3.831_705_970_207_512 / PI;
        assert!(Airy::default().value_dq(r * r).0 < 1e-12);
    }
}
