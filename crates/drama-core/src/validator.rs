//! Confirms discovered functions against fresh measurements and strips
//! address bits that do not contribute to them.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::Serialize;

use crate::function::AddressFunction;
use crate::memory::AddressPool;
use crate::oracle::{Threshold, TimingOracle};
use crate::sampler::{Isolation, Observation, ObservationLog, SampleError, Sampler, SamplerParams};
use crate::util::{Rng, bit_positions};

/// Outcome of validating a function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Disagreement within tolerance
    Confirmed {
        /// Fraction of fresh pairs the function mispredicted
        disagreement: f64,
        /// Number of fresh differences scored
        trials: usize,
    },
    /// Disagreement above tolerance
    Rejected {
        /// Fraction of fresh pairs the function mispredicted
        disagreement: f64,
        /// Number of fresh differences scored
        trials: usize,
    },
}

impl Verdict {
    /// Fraction of fresh pairs the function mispredicted.
    pub fn disagreement(&self) -> f64 {
        match *self {
            Verdict::Confirmed { disagreement, .. } | Verdict::Rejected { disagreement, .. } => {
                disagreement
            }
        }
    }

    /// Number of fresh differences the disagreement is based on.
    pub fn trials(&self) -> usize {
        match *self {
            Verdict::Confirmed { trials, .. } | Verdict::Rejected { trials, .. } => trials,
        }
    }

    /// Whether the function was confirmed.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verdict::Confirmed { .. })
    }
}

/// Validation tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorParams {
    /// Fresh pairs per validation
    pub trials: usize,
    /// Largest disagreement rate that still confirms
    pub tolerance: f64,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        ValidatorParams {
            trials: 200,
            tolerance: 0.02,
        }
    }
}

/// Re-tests functions with pairs that were not used to derive them.
///
/// The isolation passed to [`Validator::validate`] must hold every other
/// function of the group, so that a pair conflicts iff the tested function
/// does not separate it.
pub struct Validator<'a> {
    pool: &'a dyn AddressPool,
    oracle: &'a dyn TimingOracle,
    threshold: Threshold,
    params: ValidatorParams,
    sampler_params: SamplerParams,
}

impl<'a> Validator<'a> {
    /// Creates a validator measuring with `oracle` on `pool`.
    pub fn new(
        pool: &'a dyn AddressPool,
        oracle: &'a dyn TimingOracle,
        threshold: Threshold,
        params: ValidatorParams,
        sampler_params: SamplerParams,
    ) -> Self {
        Validator {
            pool,
            oracle,
            threshold,
            params,
            sampler_params,
        }
    }

    /// Measures fresh pairs admitted by `isolation` and compares their labels
    /// with the prediction of `function`. Differences in `used` are never
    /// measured again.
    ///
    /// # Errors
    ///
    /// Fails if measuring fails, or if the pool has no unused difference left.
    pub fn validate(
        &self,
        function: AddressFunction,
        isolation: &Isolation,
        used: &ObservationLog,
        rng: &mut Rng,
    ) -> Result<Verdict, SampleError> {
        let mut fresh = used.clone();
        let skip = fresh.len();
        // derivation differences are neither measured again nor scored
        let mut sampler = Sampler::new(
            self.pool,
            self.oracle,
            self.threshold,
            isolation,
            self.sampler_params,
        )
        .freeze(used);
        match sampler.sample(&mut fresh, used.distinct() + self.params.trials, rng) {
            Ok(()) => {}
            Err(SampleError::InsufficientAddressSpace { collected, .. }) if fresh.len() > skip => {
                warn!(
                    "Validating {} with only {} fresh pairs",
                    function,
                    collected - used.distinct()
                );
            }
            Err(e) => return Err(e),
        }
        // one trial per new difference, scored with its most repeated measurement
        let mut scored = HashSet::new();
        let trials: Vec<&Observation> = fresh.entries()[skip..]
            .iter()
            .map(|o| o.difference)
            .filter(|&d| !used.contains(d) && scored.insert(d))
            .filter_map(|d| fresh.get(d))
            .collect();
        if trials.is_empty() {
            return Err(SampleError::InsufficientAddressSpace {
                collected: used.distinct(),
                target: used.distinct() + self.params.trials,
            });
        }
        let mispredicted = trials
            .iter()
            .filter(|o| function.separates(o.difference) == o.label.conflict)
            .count();
        let disagreement = mispredicted as f64 / trials.len() as f64;
        debug!(
            "{}: {} of {} fresh pairs mispredicted",
            function,
            mispredicted,
            trials.len()
        );
        let trials = trials.len();
        Ok(if disagreement <= self.params.tolerance {
            Verdict::Confirmed {
                disagreement,
                trials,
            }
        } else {
            Verdict::Rejected {
                disagreement,
                trials,
            }
        })
    }

    /// Drops every bit of `function` whose removal keeps the disagreement
    /// within tolerance on a fresh sample.
    ///
    /// Bits are tried from the lowest up. Applying `minimize` to its own
    /// result returns it unchanged.
    ///
    /// # Errors
    ///
    /// See [`Validator::validate`].
    pub fn minimize(
        &self,
        function: AddressFunction,
        isolation: &Isolation,
        used: &ObservationLog,
        rng: &mut Rng,
    ) -> Result<AddressFunction, SampleError> {
        let mut mask = function.mask();
        for bit in bit_positions(function.mask()) {
            let candidate = mask & !(1 << bit);
            if candidate == 0 {
                continue;
            }
            let verdict = self.validate(AddressFunction::new(candidate), isolation, used, rng)?;
            if verdict.is_confirmed() {
                debug!("bit {} does not contribute to {}", bit, function);
                mask = candidate;
            }
        }
        let minimized = AddressFunction::new(mask);
        if minimized != function {
            info!("Minimized {} to {}", function, minimized);
        }
        Ok(minimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SyntheticPool;
    use crate::oracle::SyntheticOracle;

    const THRESHOLD: Threshold = Threshold {
        cycles: 325,
        low_median: 250,
        high_median: 400,
        repetitions: 15,
    };

    fn sampler_params() -> SamplerParams {
        SamplerParams {
            low_bit: 0,
            recheck_every: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_confirms_true_function() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 16);
        let oracle = SyntheticOracle::new(vec![0b101000]).with_noise(0.05, 3);
        let validator = Validator::new(
            &pool,
            &oracle,
            THRESHOLD,
            ValidatorParams::default(),
            sampler_params(),
        );
        let mut rng = Rng::from_seed(1);
        let verdict = validator.validate(
            AddressFunction::new(0b101000),
            &Isolation::new(0xffff),
            &ObservationLog::new(),
            &mut rng,
        )?;
        assert_eq!(
            verdict,
            Verdict::Confirmed {
                disagreement: 0.0,
                trials: 200
            }
        );
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_function() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 16);
        let oracle = SyntheticOracle::new(vec![0b101000]);
        let validator = Validator::new(
            &pool,
            &oracle,
            THRESHOLD,
            ValidatorParams::default(),
            sampler_params(),
        );
        let mut rng = Rng::from_seed(2);
        let verdict = validator.validate(
            AddressFunction::new(0b1000),
            &Isolation::new(0xffff),
            &ObservationLog::new(),
            &mut rng,
        )?;
        assert!(!verdict.is_confirmed());
        assert!(verdict.disagreement() > 0.3);
        Ok(())
    }

    #[test]
    fn test_never_reuses_differences() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 8);
        let oracle = SyntheticOracle::new(vec![1 << 4]);
        let mut used = ObservationLog::new();
        let mut rng = Rng::from_seed(3);
        Sampler::new(&pool, &oracle, THRESHOLD, &Isolation::new(0xff), sampler_params())
            .sample(&mut used, 200, &mut rng)?;
        let before = oracle.measurements();
        let validator = Validator::new(
            &pool,
            &oracle,
            THRESHOLD,
            ValidatorParams::default(),
            sampler_params(),
        );
        // only 55 unused differences remain
        let verdict = validator.validate(
            AddressFunction::new(1 << 4),
            &Isolation::new(0xff),
            &used,
            &mut rng,
        )?;
        assert!(verdict.is_confirmed());
        assert_eq!(oracle.measurements() - before, 55);
        Ok(())
    }

    #[test]
    fn test_rechecks_do_not_count_as_trials() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 10);
        let oracle = SyntheticOracle::new(vec![1 << 4]).with_noise(0.3, 5);
        let threshold = Threshold {
            repetitions: 3,
            ..THRESHOLD
        };
        // every repeated difference is measured again
        let params = SamplerParams {
            recheck_every: 1,
            ..sampler_params()
        };
        let isolation = Isolation::new(0x3ff);
        let mut used = ObservationLog::new();
        let mut rng = Rng::from_seed(6);
        Sampler::new(&pool, &oracle, threshold, &isolation, params).sample(&mut used, 800, &mut rng)?;
        let validator = Validator::new(
            &pool,
            &oracle,
            threshold,
            ValidatorParams {
                tolerance: 1.0,
                ..Default::default()
            },
            params,
        );
        let verdict = validator.validate(AddressFunction::new(1 << 4), &isolation, &used, &mut rng)?;
        assert_eq!(verdict.trials(), 200);
        Ok(())
    }

    #[test]
    fn test_minimize_drops_uncorrelated_bits() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 16);
        let oracle = SyntheticOracle::new(vec![0b101000]);
        let validator = Validator::new(
            &pool,
            &oracle,
            THRESHOLD,
            ValidatorParams::default(),
            sampler_params(),
        );
        let isolation = Isolation::new(0xffff);
        let used = ObservationLog::new();
        let mut rng = Rng::from_seed(4);
        // bit 20 never varies inside the pool
        let overfit = AddressFunction::new(0b101000 | (1 << 20));
        let once = validator.minimize(overfit, &isolation, &used, &mut rng)?;
        assert_eq!(once, AddressFunction::new(0b101000));
        let twice = validator.minimize(once, &isolation, &used, &mut rng)?;
        assert_eq!(once, twice);
        Ok(())
    }
}
