use crate::allocator::ConsecAllocator;
use crate::config::{ConfigError, DimensionConfig, DiscoveryConfig};
use crate::function::{AddressFunction, Confirmation, DiscoveredFunction, FunctionSet};
use crate::memory::{AddressPool, PhysPool, PoolError};
use crate::oracle::{OracleError, Threshold, TimingOracle, calibrate};
use crate::sampler::{Isolation, ObservationLog, SampleError, Sampler};
use crate::solver::{SolveError, Solver};
use crate::util::{NamedProgress, Rng, format_bits};
use crate::validator::{Validator, Verdict};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Main orchestrator of an address function discovery run.
///
/// The `Drama` struct combines a physical address pool and a timing oracle to
/// recover the DRAM address functions of the machine. It manages the full
/// lifecycle of a run:
///
/// 1. Calibrating the conflict threshold (retried once with more repetitions)
/// 2. Sampling labeled address pairs for each configured group of functions
/// 3. Solving the groups over GF(2)
/// 4. Validating and minimizing every recovered function with fresh pairs
///
/// A failing group does not abort the run; it is recorded in the report and
/// the next group is attempted.
///
/// # Examples
///
/// Use [`Drama::builder()`] to construct a `Drama` instance.
pub struct Drama<'a> {
    pool: &'a dyn AddressPool,
    oracle: &'a dyn TimingOracle,
    config: DiscoveryConfig,
    threshold: Option<Threshold>,
    progress: Option<MultiProgress>,
}

/// Why a group of functions could not be recovered.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionFailure {
    /// Name of the group
    pub dimension: String,
    /// Error message
    pub error: String,
}

/// Results of a discovery run.
#[derive(Debug, Serialize)]
pub struct DiscoveryReport {
    /// ISO 8601 timestamp of when the run finished
    pub date: String,
    /// Seed of all random draws
    pub seed: u64,
    /// Calibrated conflict threshold
    pub threshold: Threshold,
    /// Recovered functions in discovery order
    pub functions: FunctionSet,
    /// Groups that could not be recovered
    pub failures: Vec<DimensionFailure>,
    /// Total number of measured pairs
    pub observations: usize,
    /// Whether every group was recovered and every function confirmed
    pub confirmed: bool,
}

/// Errors that abort a discovery run.
#[derive(Debug, Error)]
pub enum Error {
    /// No pool was given to the builder
    #[error("No address pool specified")]
    Pool,
    /// No oracle was given to the builder
    #[error("No timing oracle specified")]
    Oracle,
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Calibration or measurement failed
    #[error(transparent)]
    Measurement(#[from] OracleError),
    /// Pool acquisition failed
    #[error(transparent)]
    PoolAcquisition(#[from] PoolError),
}

/// Errors that end the discovery of one group.
#[derive(Debug, Error)]
enum GroupError {
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Solve(#[from] SolveError),
}

impl<'a> Drama<'a> {
    /// Creates a new Drama builder.
    pub fn builder() -> DramaBuilder<'a> {
        DramaBuilder::default()
    }

    /// Runs discovery until done or the configured timeout expires.
    ///
    /// # Errors
    ///
    /// Returns an error if calibration fails twice or a measurement fails.
    pub fn run(&self) -> Result<DiscoveryReport, Error> {
        self.run_with_cancel(&AtomicBool::new(true))
    }

    /// Runs discovery while `running` is set.
    ///
    /// The flag and the configured timeout are checked between sampling
    /// batches. On cancellation the report holds every group finished so far.
    ///
    /// # Errors
    ///
    /// Returns an error if calibration fails twice or a measurement fails.
    pub fn run_with_cancel(&self, running: &AtomicBool) -> Result<DiscoveryReport, Error> {
        let start = Instant::now();
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!("Starting discovery with seed {}", seed);
        let mut rng = Rng::from_seed(seed);
        let threshold = match self.threshold {
            Some(threshold) => threshold,
            None => self.calibrate(&mut rng)?,
        };
        let deadline = self.config.timeout().map(|t| start + t);
        let timeout_progress = match (self.config.timeout(), self.progress.as_ref()) {
            (Some(timeout), Some(p)) => {
                let p = p.add(ProgressBar::new(timeout.as_secs()));
                p.set_style(ProgressStyle::named_bar("Global timeout"));
                Some(p)
            }
            _ => None,
        };
        let should_stop = || {
            if let Some(p) = &timeout_progress {
                p.set_position(start.elapsed().as_secs());
            }
            !running.load(Ordering::Relaxed) || check_timeout(deadline, Instant::now())
        };

        let mut functions = FunctionSet::new();
        let mut failures = vec![];
        let mut observations = 0;
        for dim in &self.config.dimensions {
            if should_stop() {
                warn!("Discovery stopped before dimension {}", dim.name);
                failures.push(DimensionFailure {
                    dimension: dim.name.clone(),
                    error: SampleError::Cancelled.to_string(),
                });
                continue;
            }
            let isolation = self.config.isolation(dim, &functions.masks());
            let mut log = ObservationLog::new();
            let result = self.discover_group(dim, &isolation, threshold, &mut log, &mut rng, &should_stop);
            observations += log.len();
            match result {
                Ok(found) => {
                    for f in found {
                        let function = f.function;
                        if let Err(e) = functions.push(f) {
                            warn!("{}", e);
                            failures.push(DimensionFailure {
                                dimension: dim.name.clone(),
                                error: format!("redundant function {}", function),
                            });
                        }
                    }
                }
                Err(GroupError::Sample(SampleError::Oracle(e))) => return Err(e.into()),
                Err(e) => {
                    warn!("Dimension {} failed: {}", dim.name, e);
                    failures.push(DimensionFailure {
                        dimension: dim.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if let Some(p) = timeout_progress {
            p.finish_and_clear();
        }
        let confirmed = failures.is_empty() && functions.is_confirmed();
        info!(
            "Discovery finished after {:?}: {} functions, {} failed dimensions\n{}",
            start.elapsed(),
            functions.len(),
            failures.len(),
            functions
        );
        Ok(DiscoveryReport {
            date: chrono::Local::now().to_rfc3339(),
            seed,
            threshold,
            functions,
            failures,
            observations,
            confirmed,
        })
    }

    /// Calibrates, retrying once with twice the repetitions.
    fn calibrate(&self, rng: &mut Rng) -> Result<Threshold, Error> {
        let spinner = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::new_spinner());
            p.set_message("Calibrating");
            p.enable_steady_tick(Duration::from_millis(200));
            p
        });
        let mut params = self.config.calibration_params();
        let result = match calibrate(self.pool, self.oracle, &params, rng) {
            Err(OracleError::CalibrationFailed(reason)) => {
                warn!(
                    "Calibration failed ({}), retrying with {} repetitions",
                    reason,
                    params.repetitions * 2
                );
                params.repetitions *= 2;
                calibrate(self.pool, self.oracle, &params, rng)
            }
            result => result,
        };
        if let Some(p) = spinner {
            p.finish_and_clear();
        }
        Ok(result?)
    }

    /// Samples, solves and validates one group of functions.
    fn discover_group(
        &self,
        dim: &DimensionConfig,
        isolation: &Isolation,
        threshold: Threshold,
        log: &mut ObservationLog,
        rng: &mut Rng,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<Vec<DiscoveredFunction>, GroupError> {
        info!(
            "Discovering {} function(s) for {} from {} observations",
            dim.functions, dim.name, dim.observations
        );
        let sampler_params = self.config.sampler_params();
        let solver_params = self.config.solver_params();
        let mut sampler = Sampler::new(self.pool, self.oracle, threshold, isolation, sampler_params);
        let bar = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::new(dim.observations as u64));
            p.set_style(ProgressStyle::named_bar(&format!("Sampling {}", dim.name)));
            p
        });

        // incremental system over first measurements, to report when the group is pinned down
        let mut tracker = Solver::composite(dim.functions, solver_params);
        let mut fed = 0;
        let mut determined_at = None;
        let mut exhausted = None;
        while log.distinct() < dim.observations {
            if should_stop() {
                return Err(SampleError::Cancelled.into());
            }
            match sampler.sample_batch(log, dim.observations, rng) {
                Ok(_) => {}
                Err(e @ SampleError::InsufficientAddressSpace { .. }) => exhausted = Some(e),
                Err(e) => return Err(e.into()),
            }
            for o in &log.entries()[fed..] {
                tracker.add(o.difference, o.label.conflict);
            }
            fed = log.len();
            if determined_at.is_none() && tracker.is_determined() {
                debug!("{} determined after {} observations", dim.name, log.distinct());
                determined_at = Some(log.distinct());
            }
            if let Some(p) = &bar {
                p.set_position(log.distinct() as u64);
                p.set_message(format!("rank {}", tracker.rank()));
            }
            if exhausted.is_some() {
                break;
            }
        }
        if let Some(p) = bar {
            p.finish_and_clear();
        }
        debug!("{}: sampler stats {:?}", dim.name, sampler.stats());
        if let Some(e) = exhausted {
            if determined_at.is_none() {
                return Err(e.into());
            }
            warn!("{} for {}, solving with the evidence collected so far", e, dim.name);
        }

        let mut solver = Solver::composite(dim.functions, solver_params);
        solver.extend(log.evidence());
        let solution = solver.solve()?;
        if !solution.determined {
            warn!(
                "Evidence for {} does not determine a unique solution, using the sparsest",
                dim.name
            );
        }

        let validator = Validator::new(
            self.pool,
            self.oracle,
            threshold,
            self.config.validator_params(),
            sampler_params,
        );
        let mut validation_rng = rng.fork();
        let bar = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::new(solution.functions.len() as u64));
            p.set_style(ProgressStyle::named_bar(&format!("Validating {}", dim.name)));
            p
        });
        let mut found = vec![];
        for (idx, &function) in solution.functions.iter().enumerate() {
            // every other function of the group is held, so conflicts depend on this one only
            let others = solution
                .functions
                .iter()
                .filter(|&&f| f != function)
                .map(AddressFunction::mask);
            let isolation = isolation.clone().holding(others);
            let name = if dim.functions == 1 {
                dim.name.clone()
            } else {
                format!("{}{}", dim.name, idx)
            };
            found.push(confirm(&validator, name, function, &isolation, log, &mut validation_rng)?);
            if let Some(p) = &bar {
                p.inc(1);
            }
        }
        if let Some(p) = bar {
            p.finish_and_clear();
        }
        Ok(found)
    }
}

/// Validates `function`, minimizes it if confirmed, and tags the result.
fn confirm(
    validator: &Validator,
    dimension: String,
    function: AddressFunction,
    isolation: &Isolation,
    used: &ObservationLog,
    rng: &mut Rng,
) -> Result<DiscoveredFunction, SampleError> {
    let mut verdict = validator.validate(function, isolation, used, rng)?;
    let mut function = function;
    if verdict.is_confirmed() {
        let minimized = validator.minimize(function, isolation, used, rng)?;
        if minimized != function {
            function = minimized;
            verdict = validator.validate(function, isolation, used, rng)?;
        }
    }
    let confirmation = match verdict {
        Verdict::Confirmed { .. } => {
            info!("{}: {}", dimension, function);
            Confirmation::Confirmed
        }
        Verdict::Rejected { disagreement, .. } => {
            warn!(
                "{}: {} rejected with disagreement {:.3}",
                dimension, function, disagreement
            );
            Confirmation::Unconfirmed {
                reason: format!("disagreement {:.3} above tolerance", disagreement),
            }
        }
    };
    Ok(DiscoveredFunction {
        dimension,
        function,
        confidence: 1.0 - verdict.disagreement(),
        confirmation,
    })
}

fn check_timeout(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|deadline| now > deadline)
}

/// Acquires the pool configured in `config`.
///
/// If the primary size cannot be satisfied and a fallback size is configured,
/// acquisition is retried once with the fallback. The reduced address window
/// is logged; bits outside of it are reported by the sampler.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub fn acquire_pool<E: std::error::Error>(
    allocator: &mut dyn ConsecAllocator<Error = E>,
    config: &DiscoveryConfig,
) -> Result<PhysPool, PoolError> {
    match (
        PhysPool::acquire(allocator, config.pool_size()),
        config.fallback_pool_size(),
    ) {
        (Err(PoolError::ResourceExhausted { requested, reason }), Some(fallback)) => {
            warn!(
                "Could not acquire {} ({}), falling back to {}",
                requested, reason, fallback
            );
            let pool = PhysPool::acquire(allocator, fallback)?;
            warn!(
                "Reduced pool covers address bits {}",
                format_bits(pool.window() & config.address_mask())
            );
            Ok(pool)
        }
        (result, _) => result,
    }
}

/// Builder for [`Drama`].
#[derive(Default)]
pub struct DramaBuilder<'a> {
    pool: Option<&'a dyn AddressPool>,
    oracle: Option<&'a dyn TimingOracle>,
    config: DiscoveryConfig,
    threshold: Option<Threshold>,
    progress: Option<MultiProgress>,
}

impl<'a> DramaBuilder<'a> {
    /// Pool to draw addresses from.
    pub fn pool(mut self, pool: &'a dyn AddressPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Oracle to measure pairs with.
    pub fn oracle(mut self, oracle: &'a dyn TimingOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Run configuration.
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Skips calibration and uses `threshold`.
    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Draws progress bars into `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Fails if the pool or oracle is missing or the configuration is invalid.
    pub fn build(self) -> Result<Drama<'a>, Error> {
        self.config.validate()?;
        Ok(Drama {
            pool: self.pool.ok_or(Error::Pool)?,
            oracle: self.oracle.ok_or(Error::Oracle)?,
            config: self.config,
            threshold: self.threshold,
            progress: self.progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BitDef;
    use crate::memory::{PhysAddr, SyntheticPool};
    use crate::oracle::SyntheticOracle;

    const THRESHOLD: Threshold = Threshold {
        cycles: 325,
        low_median: 250,
        high_median: 400,
        repetitions: 15,
    };

    /// Clears `running` once a measured pair differs in `trigger`, and
    /// optionally slows every measurement down.
    struct InterruptingOracle<'a> {
        inner: SyntheticOracle,
        running: &'a AtomicBool,
        trigger: usize,
        delay: Duration,
    }

    impl TimingOracle for InterruptingOracle<'_> {
        fn measure(&self, a: PhysAddr, b: PhysAddr, repetitions: usize) -> Result<u64, OracleError> {
            if (a.as_usize() ^ b.as_usize()) & self.trigger != 0 {
                self.running.store(false, Ordering::Relaxed);
            }
            std::thread::sleep(self.delay);
            self.inner.measure(a, b, repetitions)
        }
    }

    fn dimension(name: &str, functions: usize, observations: usize) -> DimensionConfig {
        DimensionConfig {
            name: name.into(),
            functions,
            observations,
            vary_mask: None,
            hold: vec![],
            hold_previous: false,
        }
    }

    fn config(dimensions: Vec<DimensionConfig>) -> DiscoveryConfig {
        DiscoveryConfig {
            address_bits: 20,
            repetitions: 15,
            calibration_pairs: 1000,
            noise_tolerance: 0.0,
            seed: Some(0x5eed),
            dimensions,
            ..Default::default()
        }
    }

    #[test]
    fn test_builder_requires_components() {
        let pool = SyntheticPool::new(0, 20);
        let result = Drama::builder()
            .pool(&pool)
            .config(config(vec![dimension("bank", 1, 10)]))
            .build();
        assert!(matches!(result, Err(Error::Oracle)));
        let oracle = SyntheticOracle::new(vec![1 << 13]);
        let result = Drama::builder().pool(&pool).oracle(&oracle).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_discovers_bank_functions() -> anyhow::Result<()> {
        let banks = [(1 << 6) | (1 << 13), (1 << 14) | (1 << 17), (1 << 15) | (1 << 18)];
        let pool = SyntheticPool::new(0, 20);
        let oracle = SyntheticOracle::new(banks.to_vec()).with_noise(0.05, 9);
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(config(vec![dimension("bank", 3, 600)]))
            .build()?;
        let report = drama.run()?;
        assert!(report.confirmed, "{:?}", report.failures);
        let mut found = report.functions.masks();
        found.sort();
        let mut expected = banks.to_vec();
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(report.threshold.cycles, 325);
        Ok(())
    }

    #[test]
    fn test_failed_dimension_does_not_abort() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 20);
        let oracle = SyntheticOracle::new(vec![1 << 13, 1 << 16]);
        // a single varying bit leaves no fresh pair for validation
        let mut rank = dimension("rank", 1, 400);
        rank.vary_mask = Some(1 << 16);
        let mut bank = dimension("bank", 1, 400);
        bank.hold = vec![BitDef::Single(16)];
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(config(vec![rank, bank]))
            .build()?;
        let report = drama.run()?;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].dimension, "rank");
        assert!(!report.confirmed);
        assert_eq!(report.functions.masks(), vec![1 << 13]);
        assert!(report.functions.functions()[0].is_confirmed());
        Ok(())
    }

    #[test]
    fn test_cancelled_run_reports_dimensions() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 20);
        let oracle = SyntheticOracle::new(vec![1 << 13]);
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(config(vec![dimension("bank", 1, 400)]))
            .build()?;
        let report = drama.run_with_cancel(&AtomicBool::new(false))?;
        assert!(report.functions.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(!report.confirmed);
        Ok(())
    }

    #[test]
    fn test_cancel_between_batches() -> anyhow::Result<()> {
        let running = AtomicBool::new(true);
        let oracle = InterruptingOracle {
            inner: SyntheticOracle::new(vec![1 << 13, 1 << 16]),
            running: &running,
            trigger: 1 << 16,
            delay: Duration::ZERO,
        };
        let pool = SyntheticPool::new(0, 20);
        // bank pairs never differ in bit 16, rank pairs do
        let mut bank = dimension("bank", 1, 200);
        bank.hold = vec![BitDef::Single(16)];
        let mut rank = dimension("rank", 1, 400);
        rank.hold_previous = true;
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(config(vec![bank, rank]))
            .threshold(THRESHOLD)
            .build()?;
        let report = drama.run_with_cancel(&running)?;
        assert_eq!(report.functions.masks(), vec![1 << 13]);
        assert!(report.functions.is_confirmed());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].dimension, "rank");
        assert_eq!(report.failures[0].error, SampleError::Cancelled.to_string());
        assert!(!report.confirmed);
        // rank stopped well short of its target
        assert!(report.observations >= 200);
        assert!(report.observations < 200 + 400);
        Ok(())
    }

    #[test]
    fn test_timeout_between_batches() -> anyhow::Result<()> {
        let running = AtomicBool::new(true);
        let oracle = InterruptingOracle {
            inner: SyntheticOracle::new(vec![1 << 13]),
            running: &running,
            trigger: 0,
            delay: Duration::from_millis(2),
        };
        let pool = SyntheticPool::new(0, 20);
        let mut cfg = config(vec![dimension("bank", 1, 5000)]);
        cfg.timeout_secs = Some(1);
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(cfg)
            .threshold(THRESHOLD)
            .build()?;
        let start = Instant::now();
        let report = drama.run_with_cancel(&running)?;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(running.load(Ordering::Relaxed));
        assert!(report.functions.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error, SampleError::Cancelled.to_string());
        assert!(report.observations > 0);
        assert!(report.observations < 5000);
        assert!(!report.confirmed);
        Ok(())
    }

    #[test]
    fn test_check_timeout() {
        let now = Instant::now();
        assert!(!check_timeout(None, now));
        assert!(!check_timeout(Some(now + Duration::from_secs(1)), now));
        assert!(check_timeout(Some(now), now + Duration::from_millis(1)));
    }

    #[test]
    fn test_report_serializes() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 16);
        let oracle = SyntheticOracle::new(vec![0b101000]);
        let mut cfg = config(vec![dimension("bank", 1, 200)]);
        cfg.address_bits = 16;
        cfg.low_bit = 0;
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(cfg)
            .build()?;
        let report = drama.run()?;
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["functions"]["functions"][0]["function"], 0b101000);
        assert_eq!(json["functions"]["functions"][0]["status"], "confirmed");
        assert_eq!(json["confirmed"], true);
        Ok(())
    }
}
