use crate::model::profile::{ProfileOptions, RadialProfile};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};
use std::sync::OnceLock;

macro_const! {
    const DOC: &str = r"
Elliptical Moffat profile

$$
f(r^2) = \frac{\beta - 1}{\pi r_d^2 N} \left(1 + \frac{r^2}{r_d^2}\right)^{-\beta}
\quad \text{for } r < T,
$$
$f$ is zero beyond the truncation radius $T$. `scale` is the half-light radius of the round
profile, $T$ is measured in half-light radii. Without truncation ($T = 0$, default)
$N = 1$ and $r_d^2 = 1 / (2^{1/(\beta - 1)} - 1)$, otherwise
$N = 1 - (1 + T^2 / r_d^2)^{1 - \beta}$ and $r_d$ is found numerically.

$\beta$ must be larger than unity, a non-zero $T$ must be larger than $\sqrt{2}$.

- Interpolated parameters: `scale`, `g1`, `g2` (`du`, `dv` first unless the centroid is forced)
";
}

/// Relative tolerance of the $r_d^2$ root
const RD_TOLERANCE: f64 = 1e-14;

#[doc = DOC!()]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Moffat {
    beta: f64,
    /// Truncation radius in half-light radii, zero for no truncation
    #[serde(default)]
    trunc: f64,
    #[serde(flatten)]
    pub options: ProfileOptions,
    #[serde(skip)]
    shape: OnceLock<Shape>,
}

/// $r_d^2$ and the amplitude $(\beta - 1) / (\pi r_d^2 N)$
#[derive(Clone, Copy, Debug)]
struct Shape {
    rd_sq: f64,
    amplitude: f64,
}

impl Moffat {
    /// Panics if `beta` is not larger than unity
    pub fn new(beta: f64, options: ProfileOptions) -> Self {
        Self::truncated(beta, 0.0, options)
    }

    /// Panics if `beta` is not larger than unity or non-zero `trunc` is not larger than
    /// $\sqrt{2}$
    pub fn truncated(beta: f64, trunc: f64, options: ProfileOptions) -> Self {
        let moffat = Self {
            beta,
            trunc,
            options,
            shape: OnceLock::new(),
        };
        if let Err(message) = moffat.validate() {
            panic!("{message}");
        }
        moffat
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn trunc(&self) -> f64 {
        self.trunc
    }

    #[inline]
    pub fn default_beta() -> f64 {
        3.5
    }

    pub fn doc() -> &'static str {
        DOC
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.beta.is_finite() && self.beta > 1.0) {
            return Err(format!(
                "Moffat beta must be larger than unity, {} given",
                self.beta
            ));
        }
        if !(self.trunc == 0.0 || (self.trunc.is_finite() && self.trunc > SQRT_2)) {
            return Err(format!(
                "Moffat trunc must be zero or larger than sqrt(2), {} given",
                self.trunc
            ));
        }
        Ok(())
    }

    /// Fraction of the untruncated flux inside radius $\sqrt{q}$
    #[inline]
    fn enclosed(&self, rd_sq: f64, q: f64) -> f64 {
        -f64::exp_m1((1.0 - self.beta) * f64::ln_1p(q / rd_sq))
    }

    fn shape(&self) -> Shape {
        *self.shape.get_or_init(|| {
            let rd_sq = if self.trunc > 0.0 {
                self.truncated_rd_sq()
            } else {
                (f64::powf(2.0, 1.0 / (self.beta - 1.0)) - 1.0).recip()
            };
            let norm = if self.trunc > 0.0 {
                self.enclosed(rd_sq, self.trunc * self.trunc)
            } else {
                1.0
            };
            Shape {
                rd_sq,
                amplitude: (self.beta - 1.0) / (PI * rd_sq * norm),
            }
        })
    }

    /// Solve for $r_d^2$ giving half of the truncated flux inside the unit radius
    ///
    /// The half-light excess is positive for small $r_d$ and negative for large ones as long as
    /// $T > \sqrt{2}$, the root is bracketed and bisected in $\ln r_d^2$.
    fn truncated_rd_sq(&self) -> f64 {
        let t_sq = self.trunc * self.trunc;
        let excess = |rd_sq: f64| 2.0 * self.enclosed(rd_sq, 1.0) - self.enclosed(rd_sq, t_sq);
        let mut lo = 1e-3_f64;
        while excess(lo) <= 0.0 && lo > f64::MIN_POSITIVE {
            lo *= 1e-3;
        }
        let mut hi = 1.0_f64;
        while excess(hi) > 0.0 && hi < 1e300 {
            hi *= 10.0;
        }
        while hi / lo - 1.0 > RD_TOLERANCE {
            let mid = (lo * hi).sqrt();
            if excess(mid) > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        (lo * hi).sqrt()
    }
}

impl Default for Moffat {
    fn default() -> Self {
        Self::new(Self::default_beta(), ProfileOptions::default())
    }
}

impl PartialEq for Moffat {
    fn eq(&self, other: &Self) -> bool {
        self.beta == other.beta && self.trunc == other.trunc && self.options == other.options
    }
}

impl RadialProfile for Moffat {
    fn options(&self) -> &ProfileOptions {
        &self.options
    }

    #[inline]
    fn value_dq(&self, q: f64) -> (f64, f64) {
        if self.trunc > 0.0 && q >= self.trunc * self.trunc {
            return (0.0, 0.0);
        }
        let Shape { rd_sq, amplitude } = self.shape();
        let base = 1.0 + q / rd_sq;
        let f = amplitude * base.powf(-self.beta);
        (f, -self.beta / rd_sq * f / base)
    }

    fn scale_per_sigma(&self) -> f64 {
        // half-light radius of a Gaussian is sqrt(2 ln 2) sigma
        f64::sqrt(2.0 * std::f64::consts::LN_2)
    }
}
