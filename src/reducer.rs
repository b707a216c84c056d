//! Summary statistics of a finished session

use crate::data::StarData;
use crate::fitter::{FlagReason, StarRecord};
use crate::moments::adaptive_moments;
use crate::psf::Psf;
use crate::sorted_array::SortedArray;
use crate::types::StarIndex;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Aggregated $\chi^2$ of a group of stars
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChisqStats {
    pub nstars: usize,
    /// Sum of $\chi^2$ over the group
    pub chisq: f64,
    /// Sum of degrees of freedom over the group
    pub dof: i64,
    /// `chisq / dof` of the whole group
    pub reduced_chisq: f64,
    /// Median of per-star reduced $\chi^2$
    pub median: f64,
    /// Maximum of per-star reduced $\chi^2$
    pub max: f64,
}

impl ChisqStats {
    fn new(values: impl IntoIterator<Item = (f64, i64)>) -> Option<Self> {
        let values = values.into_iter().collect_vec();
        if values.is_empty() {
            return None;
        }
        let chisq = values.iter().map(|(chisq, _)| chisq).sum::<f64>();
        let dof = values.iter().map(|(_, dof)| dof).sum::<i64>();
        let per_star: SortedArray = values
            .iter()
            .map(|&(chisq, dof)| if dof > 0 { chisq / dof as f64 } else { f64::INFINITY })
            .collect();
        Some(Self {
            nstars: values.len(),
            chisq,
            dof,
            reduced_chisq: if dof > 0 { chisq / dof as f64 } else { f64::INFINITY },
            median: per_star.median(),
            max: per_star.maximum(),
        })
    }
}

/// $\chi^2$ aggregates and flagged stars of a solution
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FitReport {
    pub n_stars: usize,
    /// Training stars left at the end of the session
    pub n_training: usize,
    /// Reserve stars which are not flagged
    pub n_reserve: usize,
    pub flagged: Vec<StarIndex>,
    pub n_preset: usize,
    pub n_fit_failed: usize,
    pub n_residual_failed: usize,
    pub n_outliers: usize,
    /// Single-star fits of all non-flagged stars
    pub fit: Option<ChisqStats>,
    /// Interpolated model against training stars
    pub training: Option<ChisqStats>,
    /// Interpolated model against reserve stars, the held-out validation of the solution
    pub reserve: Option<ChisqStats>,
}

impl FitReport {
    pub fn new(records: &[StarRecord]) -> Self {
        let count = |f: fn(&FlagReason) -> bool| {
            records
                .iter()
                .filter(|r| r.flag.as_ref().is_some_and(f))
                .count()
        };
        let active = || records.iter().filter(|r| !r.is_flagged());
        let residuals = |reserve: bool| {
            ChisqStats::new(
                active()
                    .filter(|r| r.reserve == reserve)
                    .filter_map(|r| r.residual.as_ref())
                    .map(|residual| (residual.chisq, residual.dof)),
            )
        };
        Self {
            n_stars: records.len(),
            n_training: active().filter(|r| !r.reserve).count(),
            n_reserve: active().filter(|r| r.reserve).count(),
            flagged: records.iter().positions(StarRecord::is_flagged).collect(),
            n_preset: count(|reason| matches!(reason, FlagReason::Preset)),
            n_fit_failed: count(|reason| matches!(reason, FlagReason::FitFailed(_))),
            n_residual_failed: count(|reason| matches!(reason, FlagReason::ResidualFailed(_))),
            n_outliers: count(|reason| matches!(reason, FlagReason::Outlier { .. })),
            fit: ChisqStats::new(
                active()
                    .filter_map(|r| r.fit.as_ref())
                    .map(|fit| (fit.chisq, fit.dof)),
            ),
            training: residuals(false),
            reserve: residuals(true),
        }
    }
}

/// Mean and standard deviation of model-minus-star adaptive moments
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShapeStats {
    pub nstars: usize,
    pub mean_dsigma: f64,
    pub std_dsigma: f64,
    pub mean_dg1: f64,
    pub std_dg1: f64,
    pub mean_dg2: f64,
    pub std_dg2: f64,
}

impl ShapeStats {
    fn new(diffs: &[[f64; 3]]) -> Option<Self> {
        if diffs.is_empty() {
            return None;
        }
        let mean_std = |k: usize| {
            let n = diffs.len() as f64;
            let mean = diffs.iter().map(|d| d[k]).sum::<f64>() / n;
            let std = if diffs.len() > 1 {
                f64::sqrt(diffs.iter().map(|d| (d[k] - mean).powi(2)).sum::<f64>() / (n - 1.0))
            } else {
                0.0
            };
            (mean, std)
        };
        let (mean_dsigma, std_dsigma) = mean_std(0);
        let (mean_dg1, std_dg1) = mean_std(1);
        let (mean_dg2, std_dg2) = mean_std(2);
        Some(Self {
            nstars: diffs.len(),
            mean_dsigma,
            std_dsigma,
            mean_dg1,
            std_dg1,
            mean_dg2,
            std_dg2,
        })
    }
}

/// Shape residuals of training and reserve stars
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShapeReport {
    pub training: Option<ShapeStats>,
    pub reserve: Option<ShapeStats>,
    /// Non-flagged stars for which either moment measurement failed
    pub n_failed: usize,
}

/// Size and shear of the model drawn on the stamp minus the ones of the star
fn shape_diff(
    psf: &Psf,
    star: &StarData,
    fit_center: bool,
    max_iterations: usize,
) -> Option<[f64; 3]> {
    let observed = adaptive_moments(star).ok()?;
    let (image, _) = psf.draw_star(star, fit_center, max_iterations).ok()?;
    let model = adaptive_moments(&star.with_image(image).ok()?).ok()?;
    Some([
        model.sigma - observed.sigma,
        model.g1 - observed.g1,
        model.g2 - observed.g2,
    ])
}

/// Compare adaptive moments of every non-flagged star to the moments of the interpolated model
/// drawn on the same stamp
pub fn shape_report(
    psf: &Psf,
    stars: &[StarData],
    records: &[StarRecord],
    fit_center: bool,
    max_iterations: usize,
) -> ShapeReport {
    let mut training = vec![];
    let mut reserve = vec![];
    let mut n_failed = 0;
    for (i, (star, record)) in stars.iter().zip(records).enumerate() {
        if record.is_flagged() {
            continue;
        }
        match shape_diff(psf, star, fit_center, max_iterations) {
            Some(diff) if record.reserve => reserve.push(diff),
            Some(diff) => training.push(diff),
            None => {
                log::debug!("Star {i}: shape measurement failed");
                n_failed += 1;
            }
        }
    }
    ShapeReport {
        training: ShapeStats::new(&training),
        reserve: ShapeStats::new(&reserve),
        n_failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PsfConfig;
    use crate::data::{Residual, StarFit};
    use crate::error::FitError;
    use crate::fitter::PsfFitter;
    use crate::tests::*;

    use field_psf_test_util::grid_positions;

    fn record(reserve: bool, flag: Option<FlagReason>, chisq: f64) -> StarRecord {
        StarRecord {
            reserve,
            fit: Some(StarFit::new(vec![1.0, 0.0, 0.0], 100.0, [0.0, 0.0], chisq, 10)),
            residual: Some(Residual {
                flux: 100.0,
                center: [0.0, 0.0],
                chisq: 2.0 * chisq,
                dof: 12,
            }),
            flag,
        }
    }

    #[test]
    fn fit_report() {
        let records = [
            record(false, None, 10.0),
            record(false, None, 20.0),
            record(false, None, 30.0),
            record(true, None, 5.0),
            record(false, Some(FlagReason::FitFailed(FitError::NonFinite)), 1e3),
            record(
                false,
                Some(FlagReason::Outlier {
                    iteration: 1,
                    reduced_chisq: 50.0,
                    threshold: 3.0,
                }),
                300.0,
            ),
            record(true, Some(FlagReason::Preset), 1e3),
        ];
        let report = FitReport::new(&records);
        assert_eq!(report.n_stars, 7);
        assert_eq!(report.n_training, 3);
        assert_eq!(report.n_reserve, 1);
        assert_eq!(report.flagged, vec![4, 5, 6]);
        assert_eq!(
            (report.n_preset, report.n_fit_failed, report.n_outliers),
            (1, 1, 1)
        );
        assert_eq!(report.n_residual_failed, 0);

        let fit = report.fit.unwrap();
        assert_eq!(fit.nstars, 4);
        assert_eq!(fit.chisq, 65.0);
        assert_eq!(fit.dof, 40);
        assert_eq!(fit.median, 1.5);
        assert_eq!(fit.max, 3.0);

        let training = report.training.unwrap();
        assert_eq!(training.nstars, 3);
        assert_eq!(training.reduced_chisq, 120.0 / 36.0);
        let reserve = report.reserve.unwrap();
        assert_eq!(reserve.nstars, 1);
        assert_eq!(reserve.chisq, 10.0);
    }

    #[test]
    fn empty_groups() {
        let report = FitReport::new(&[record(false, Some(FlagReason::Preset), 1.0)]);
        assert_eq!(report.fit, None);
        assert_eq!(report.training, None);
        assert_eq!(report.reserve, None);
    }

    #[test]
    fn shape_residuals_of_exact_model() {
        let stars = noiseless_catalog(&grid_positions(4, 4), 0);
        let fitter = PsfFitter::new(PsfConfig::default().with_reserve_frac(0.25)).unwrap();
        let solution = fitter.solve(&stars).unwrap();
        let report = fitter.shape_report(&solution, &stars);
        assert_eq!(report.n_failed, 0);
        let training = report.training.unwrap();
        let reserve = report.reserve.unwrap();
        assert_eq!(training.nstars, 12);
        assert_eq!(reserve.nstars, 4);
        for stats in [training, reserve] {
            assert_abs_diff_eq!(stats.mean_dsigma, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(stats.mean_dg1, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(stats.std_dg2, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn serde_json_round_trip() {
        let report = FitReport::new(&[record(false, None, 3.0), record(true, None, 4.0)]);
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(serde_json::from_str::<FitReport>(&json).unwrap(), report);
    }
}
