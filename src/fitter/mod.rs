//! Fit-reject loop building a [Psf] from a star catalog
//!
//! A session runs the state machine
//! `Init -> FitStars -> FitInterp -> ComputeResiduals -> Reject -> FitStars -> ...`
//! until the rejection step removes no training stars, the iteration cap is hit or the time
//! budget runs out. Every phase works on the per-star records owned by the session, flags are
//! only ever added.

use crate::config::PsfConfig;
use crate::data::StarData;
use crate::error::{InterpError, SolveError, Warning};
use crate::interp::InterpolatorTrait;
use crate::model::ModelTrait;
use crate::psf::Psf;
use crate::reducer::{FitReport, ShapeReport, shape_report};
use crate::types::StarIndex;

use itertools::Itertools;
use rand::prelude::*;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::time::{Duration, Instant};

mod outliers;
use outliers::sigma_clip;

mod state;
use state::Phase;
pub use state::{FlagReason, IterationSummary, StarRecord, Termination};

/// Runs fitting sessions with a fixed configuration
#[derive(Debug)]
pub struct PsfFitter {
    config: PsfConfig,
    pool: ThreadPool,
}

/// Result of a successful session
#[derive(Clone, Debug)]
pub struct PsfSolution {
    pub psf: Psf,
    /// One record per input star, in input order
    pub records: Vec<StarRecord>,
    pub termination: Termination,
    /// Number of completed iterations
    pub iterations: usize,
    pub history: Vec<IterationSummary>,
    pub warnings: Vec<Warning>,
    pub report: FitReport,
}

impl PsfSolution {
    /// Flag state of every star, can be used to resume with [PsfFitter::solve_from]
    pub fn flags(&self) -> Vec<bool> {
        self.records.iter().map(StarRecord::is_flagged).collect()
    }

    pub fn flagged(&self) -> Vec<StarIndex> {
        self.records.iter().positions(StarRecord::is_flagged).collect()
    }

    pub fn reserve(&self) -> Vec<StarIndex> {
        self.records.iter().positions(|r| r.reserve).collect()
    }
}

impl PsfFitter {
    pub fn new(config: PsfConfig) -> Result<Self, SolveError> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers.unwrap_or(0))
            .build()?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &PsfConfig {
        &self.config
    }

    /// Build a PSF from scratch
    pub fn solve(&self, stars: &[StarData]) -> Result<PsfSolution, SolveError> {
        self.solve_from(stars, &vec![false; stars.len()])
    }

    /// Build a PSF starting from a previous flag state, `flags[i]` excludes star `i` from the
    /// session
    pub fn solve_from(
        &self,
        stars: &[StarData],
        flags: &[bool],
    ) -> Result<PsfSolution, SolveError> {
        if stars.is_empty() {
            return Err(SolveError::EmptyCatalog);
        }
        if flags.len() != stars.len() {
            return Err(SolveError::FlagsMismatch {
                actual: flags.len(),
                expected: stars.len(),
            });
        }
        Session::new(self, stars, flags).run(Phase::Init)
    }

    /// Moment-based shape residuals of the solution, see [shape_report]
    pub fn shape_report(&self, solution: &PsfSolution, stars: &[StarData]) -> ShapeReport {
        shape_report(
            &solution.psf,
            stars,
            &solution.records,
            self.config.fit_center,
            self.config.max_fit_iterations,
        )
    }
}

/// Indices of reserve stars, depends only on the catalog size and the configuration
fn reserve_partition(n: usize, config: &PsfConfig) -> Vec<bool> {
    let mut reserve = vec![false; n];
    let amount = (config.reserve_frac * n as f64).round() as usize;
    let mut rng = StdRng::seed_from_u64(config.seed);
    for i in rand::seq::index::sample(&mut rng, n, amount.min(n)) {
        reserve[i] = true;
    }
    reserve
}

/// Mutable state of a single fitting session
struct Session<'a> {
    config: &'a PsfConfig,
    pool: &'a ThreadPool,
    stars: &'a [StarData],
    flags: &'a [bool],
    records: Vec<StarRecord>,
    deadline: Option<Instant>,
    iteration: usize,
    psf: Option<Psf>,
    summary: Option<IterationSummary>,
    history: Vec<IterationSummary>,
    warnings: Vec<Warning>,
}

impl<'a> Session<'a> {
    fn new(fitter: &'a PsfFitter, stars: &'a [StarData], flags: &'a [bool]) -> Self {
        let start = Instant::now();
        let deadline = fitter
            .config
            .time_budget
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
            .and_then(|budget| start.checked_add(budget));
        Self {
            config: &fitter.config,
            pool: &fitter.pool,
            stars,
            flags,
            records: vec![],
            deadline,
            iteration: 0,
            psf: None,
            summary: None,
            history: vec![],
            warnings: vec![],
        }
    }

    /// Run the state machine from `phase` to the end of the session
    fn run(mut self, mut phase: Phase) -> Result<PsfSolution, SolveError> {
        loop {
            if let Phase::Done(termination) = phase {
                return self.finish(termination);
            }
            phase = self.step(phase)?;
        }
    }

    /// Execute a single phase and return the next one
    fn step(&mut self, phase: Phase) -> Result<Phase, SolveError> {
        let next = match phase {
            Phase::Init => {
                self.init();
                Phase::FitStars
            }
            Phase::FitStars => {
                if self.deadline_passed() {
                    if self.psf.is_none() {
                        return Err(SolveError::Cancelled);
                    }
                    self.warn(Warning::Cancelled {
                        iteration: self.iteration,
                    });
                    Phase::Done(Termination::Cancelled)
                } else {
                    self.fit_stars();
                    Phase::FitInterp
                }
            }
            Phase::FitInterp => {
                self.fit_interp()?;
                Phase::ComputeResiduals
            }
            Phase::ComputeResiduals => {
                self.compute_residuals();
                Phase::Reject
            }
            Phase::Reject => self.reject(),
            Phase::Done(termination) => Phase::Done(termination),
        };
        Ok(next)
    }

    fn init(&mut self) {
        let reserve = reserve_partition(self.stars.len(), self.config);
        self.records = reserve
            .into_iter()
            .zip(self.flags)
            .map(|(reserve, &flag)| StarRecord::new(reserve, flag))
            .collect();
        log::debug!(
            "Session started with {} stars, {} reserved, {} flagged",
            self.records.len(),
            self.records.iter().filter(|r| r.reserve).count(),
            self.records.iter().filter(|r| r.is_flagged()).count(),
        );
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn warn(&mut self, warning: Warning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    fn summary(&mut self) -> &mut IterationSummary {
        let iteration = self.iteration;
        self.summary.get_or_insert_with(|| IterationSummary {
            iteration,
            n_training: 0,
            n_reserve: 0,
            n_fit_failed: 0,
            n_residual_failed: 0,
            n_rejected: 0,
            n_training_removed: 0,
            flagged: vec![],
            median: f64::NAN,
            threshold: f64::NAN,
        })
    }

    fn fit_stars(&mut self) {
        self.iteration += 1;
        self.summary = None;
        let model = &self.config.model;
        let max_iterations = self.config.max_fit_iterations;
        let stars = self.stars;
        let records = &self.records;
        let fits = self.pool.install(|| {
            stars
                .par_iter()
                .zip(records.par_iter())
                .map(|(star, record)| {
                    (!record.is_flagged()).then(|| model.fit(star, max_iterations))
                })
                .collect::<Vec<_>>()
        });

        let mut n_fit_failed = 0;
        for (record, fit) in self.records.iter_mut().zip(fits) {
            let Some(fit) = fit else {
                continue;
            };
            let failure = fit.failure.clone();
            record.fit = Some(fit.with_reserve(record.reserve));
            if let Some(error) = failure {
                record.set_flag(FlagReason::FitFailed(error));
                n_fit_failed += 1;
            }
        }
        log::debug!(
            "Iteration {}: {} single-star fits failed",
            self.iteration,
            n_fit_failed
        );
        self.summary().n_fit_failed = n_fit_failed;
    }

    fn fit_interp(&mut self) -> Result<(), SolveError> {
        let (positions, params): (Vec<_>, Vec<_>) = self
            .stars
            .iter()
            .zip(&self.records)
            .filter(|(_, record)| record.is_training())
            .filter_map(|(star, record)| {
                let fit = record.fit.as_ref()?;
                Some((star.field_pos(), fit.params.clone()))
            })
            .unzip();
        let n_training = positions.len();
        let iteration = self.iteration;

        let interp = match self.config.interp.train(&positions, &params) {
            Ok(interp) => interp,
            Err(source @ InterpError::InsufficientData { .. }) => {
                return Err(SolveError::InsufficientStars { iteration, source });
            }
            Err(source) => return Err(SolveError::Interpolation { iteration, source }),
        };
        let psf = Psf::new(
            self.config.model.clone(),
            interp.with_policy(self.config.extrapolation),
        )?;
        log::debug!("Iteration {iteration}: interpolator trained on {n_training} stars");
        self.psf = Some(psf);
        self.summary().n_training = n_training;
        Ok(())
    }

    fn compute_residuals(&mut self) {
        let Some(psf) = self.psf.as_ref() else {
            return;
        };
        let mut extrapolated = vec![];
        let mut n_residual_failed = 0;
        let mut n_training_removed = 0;
        for (i, (star, record)) in self.stars.iter().zip(self.records.iter_mut()).enumerate() {
            if record.is_flagged() {
                continue;
            }
            let Some(fit) = record.fit.as_ref() else {
                continue;
            };
            let instance = psf.get_psf(star.field_pos());
            if instance.extrapolated {
                extrapolated.push(Warning::DomainExtrapolation {
                    star: Some(i),
                    position: star.field_pos(),
                });
            }
            let residual = psf.model().reflux(
                star,
                &instance.params,
                fit,
                self.config.fit_center,
                self.config.max_fit_iterations,
            );
            match residual {
                Ok(residual) => {
                    log::trace!(
                        "Star {i}: residual reduced chi2 {}",
                        residual.reduced_chisq()
                    );
                    record.residual = Some(residual);
                }
                Err(error) => {
                    log::trace!("Star {i}: residual failed: {error}");
                    if record.is_training() {
                        n_training_removed += 1;
                    }
                    record.set_flag(FlagReason::ResidualFailed(error));
                    n_residual_failed += 1;
                }
            }
        }
        for warning in extrapolated {
            if !self.warnings.contains(&warning) {
                self.warn(warning);
            }
        }
        log::debug!(
            "Iteration {}: {} residuals failed",
            self.iteration,
            n_residual_failed
        );
        let summary = self.summary();
        summary.n_residual_failed = n_residual_failed;
        summary.n_training_removed = n_training_removed;
    }

    fn reject(&mut self) -> Phase {
        let values = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_training())
            .filter_map(|(i, record)| Some((i, record.residual.as_ref()?.reduced_chisq())))
            .collect_vec();
        let clip = sigma_clip(&self.config.outliers, &values);
        for &(i, reduced_chisq) in &clip.rejected {
            log::debug!(
                "Iteration {}: star {i} rejected, reduced chi2 {reduced_chisq} > {}",
                self.iteration,
                clip.threshold
            );
            self.records[i].set_flag(FlagReason::Outlier {
                iteration: self.iteration,
                reduced_chisq,
                threshold: clip.threshold,
            });
        }

        let flagged = self
            .records
            .iter()
            .positions(StarRecord::is_flagged)
            .collect_vec();
        let n_reserve = self
            .records
            .iter()
            .filter(|r| r.reserve && !r.is_flagged())
            .count();
        let summary = self.summary();
        summary.n_rejected = clip.rejected.len();
        summary.n_training_removed += clip.rejected.len();
        summary.flagged = flagged;
        summary.n_reserve = n_reserve;
        summary.median = clip.median;
        summary.threshold = clip.threshold;
        let summary = summary.clone();
        log::info!(
            "Iteration {}: {} training stars, median reduced chi2 {:.4}, {} rejected, {} flagged in total",
            summary.iteration,
            summary.n_training,
            summary.median,
            summary.n_rejected,
            summary.flagged.len()
        );
        let removed = summary.n_training_removed;
        self.history.push(summary);

        if removed == 0 {
            Phase::Done(Termination::Converged)
        } else if self.iteration >= self.config.max_iterations {
            self.warn(Warning::NonConvergence {
                iterations: self.iteration,
            });
            Phase::Done(Termination::MaxIterations)
        } else {
            Phase::FitStars
        }
    }

    fn finish(self, termination: Termination) -> Result<PsfSolution, SolveError> {
        let psf = self.psf.ok_or(SolveError::Cancelled)?;
        let report = FitReport::new(&self.records);
        log::info!(
            "Session finished after {} iterations: {termination:?}, {} of {} stars flagged",
            self.iteration,
            report.flagged.len(),
            report.n_stars
        );
        Ok(PsfSolution {
            psf,
            records: self.records,
            termination,
            iterations: self.iteration,
            history: self.history,
            warnings: self.warnings,
            report,
        })
    }
}
