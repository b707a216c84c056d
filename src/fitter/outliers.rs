use crate::config::OutlierConfig;
use crate::sorted_array::SortedArray;
use crate::types::StarIndex;

use itertools::Itertools;

/// Scale of the median absolute deviation to the standard deviation of a normal distribution
const MAD_TO_SIGMA: f64 = 1.4826;

/// Outcome of sigma-clipping
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Clip {
    pub median: f64,
    pub threshold: f64,
    /// Rejected stars with their statistic, worst first
    pub rejected: Vec<(StarIndex, f64)>,
}

/// Sigma-clip stars by their residual reduced $\chi^2$
///
/// NaN statistic is treated as infinitely bad.
pub(super) fn sigma_clip(config: &OutlierConfig, values: &[(StarIndex, f64)]) -> Clip {
    if values.is_empty() {
        return Clip {
            median: f64::NAN,
            threshold: f64::NAN,
            rejected: vec![],
        };
    }
    let values = values
        .iter()
        .map(|&(i, x)| (i, if x.is_nan() { f64::INFINITY } else { x }))
        .collect_vec();
    let sorted: SortedArray = values.iter().map(|&(_, x)| x).collect();
    let median = sorted.median();
    let spread = (MAD_TO_SIGMA * sorted.median_absolute_deviation()).max(config.min_spread);
    let threshold = median + config.nsigma * spread;

    let mut rejected = values
        .into_iter()
        .filter(|&(_, x)| x > threshold)
        .sorted_by(|(i_a, a), (i_b, b)| b.total_cmp(a).then(i_a.cmp(i_b)))
        .collect_vec();
    if let Some(max_remove) = config.max_remove {
        let cap = (max_remove * sorted.len() as f64).ceil() as usize;
        rejected.truncate(cap);
    }
    Clip {
        median,
        threshold,
        rejected,
    }
}
