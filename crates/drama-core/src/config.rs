//! JSON configuration of a discovery run.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::BitRange;
use crate::oracle::CalibrationParams;
use crate::sampler::{Isolation, SamplerParams};
use crate::solver::SolverParams;
use crate::util::{Size, bit_window};
use crate::validator::ValidatorParams;

/// Errors that can occur when loading a configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A set of physical address bits, given as one bit or a list of bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BitDef {
    /// Single bit
    Single(u64),
    /// XOR of multiple bits
    Multi(Vec<u64>),
}

impl BitDef {
    /// Converts the bit definition to a bitmask. Bits beyond the address
    /// width contribute nothing; [`DiscoveryConfig::validate`] rejects them.
    pub fn to_bitstr(&self) -> usize {
        self.bits().fold(0, |mask, bit| mask | single_bit(bit))
    }

    fn bits(&self) -> impl Iterator<Item = u64> + '_ {
        match self {
            BitDef::Single(bit) => std::slice::from_ref(bit).iter().copied(),
            BitDef::Multi(bits) => bits.iter().copied(),
        }
    }
}

fn single_bit(bit: u64) -> usize {
    u32::try_from(bit)
        .ok()
        .and_then(|bit| 1usize.checked_shl(bit))
        .unwrap_or(0)
}

/// One group of functions discovered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    /// Name of the group, e.g. `bank`. Functions are reported as `name0`, `name1`, ...
    pub name: String,
    /// Number of functions in the group
    #[serde(default = "default_functions")]
    pub functions: usize,
    /// Distinct differences to collect for this group
    #[serde(default = "default_observations")]
    pub observations: usize,
    /// Bits allowed to differ within a pair (default: `low_bit..address_bits`)
    #[serde(default)]
    pub vary_mask: Option<usize>,
    /// Known functions both addresses of a pair agree on
    #[serde(default)]
    pub hold: Vec<BitDef>,
    /// Also hold every function found for earlier groups
    #[serde(default)]
    pub hold_previous: bool,
}

fn default_functions() -> usize {
    1
}

fn default_observations() -> usize {
    1000
}

/// Parameters of a discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Size of the physical memory pool in MiB
    pub pool_size_mb: usize,
    /// Smaller pool size tried once if the first acquisition fails
    pub fallback_pool_size_mb: Option<usize>,
    /// Rounds per timing measurement
    pub repetitions: usize,
    /// Random pairs measured during calibration
    pub calibration_pairs: usize,
    /// Minimum relative gap between the calibrated latency classes
    pub min_separation: f64,
    /// Number of physical address bits considered
    pub address_bits: usize,
    /// Lowest address bit considered (cache line offset bits never matter)
    pub low_bit: usize,
    /// New differences measured between two solver updates
    pub batch_size: usize,
    /// Measurement threads
    pub threads: usize,
    /// Consecutive draws without a new difference before the pool counts as exhausted
    pub max_idle_draws: usize,
    /// Every n-th repeated difference is measured again (0 = never)
    pub recheck_every: usize,
    /// Repetition multiplier for re-measuring disputed differences
    pub escalation_factor: usize,
    /// Fraction of observations allowed to contradict the solution
    pub noise_tolerance: f64,
    /// Fresh pairs per validation
    pub validation_trials: usize,
    /// Largest disagreement rate that still confirms a function
    pub validation_tolerance: f64,
    /// Largest number of bits of a single function
    pub max_function_weight: u32,
    /// Overall timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Seed of all random draws (random if unset)
    pub seed: Option<u64>,
    /// Groups of functions, discovered in order
    pub dimensions: Vec<DimensionConfig>,
    /// Row bits for decoding addresses, e.g. `"18-33"`
    pub row_bits: Option<BitRange>,
    /// Column bits for decoding addresses, e.g. `"0-12"`
    pub col_bits: Option<BitRange>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            pool_size_mb: 1024,
            fallback_pool_size_mb: None,
            repetitions: 100,
            calibration_pairs: 2000,
            min_separation: 0.1,
            address_bits: 30,
            low_bit: 6,
            batch_size: 64,
            threads: 1,
            max_idle_draws: 10_000,
            recheck_every: 16,
            escalation_factor: 4,
            noise_tolerance: 0.02,
            validation_trials: 200,
            validation_tolerance: 0.05,
            max_function_weight: 12,
            timeout_secs: None,
            seed: None,
            dimensions: vec![],
            row_bits: None,
            col_bits: None,
        }
    }
}

impl DiscoveryConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or fails [`DiscoveryConfig::validate`].
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<DiscoveryConfig, ConfigError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: DiscoveryConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values no run can succeed with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.dimensions.is_empty() {
            return invalid("no dimensions configured".into());
        }
        if self.repetitions == 0 {
            return invalid("repetitions must be positive".into());
        }
        if self.address_bits > usize::BITS as usize || self.low_bit >= self.address_bits {
            return invalid(format!(
                "address bits {}..{} are empty or exceed the address width",
                self.low_bit, self.address_bits
            ));
        }
        if !(0.0..1.0).contains(&self.noise_tolerance)
            || !(0.0..1.0).contains(&self.validation_tolerance)
        {
            return invalid("tolerances must be in [0, 1)".into());
        }
        for dim in &self.dimensions {
            if dim.functions == 0 {
                return invalid(format!("dimension {} has no functions", dim.name));
            }
            if let Some(bit) = dim
                .hold
                .iter()
                .flat_map(BitDef::bits)
                .find(|&bit| bit >= u64::from(usize::BITS))
            {
                return invalid(format!(
                    "dimension {} holds bit {} beyond the address width",
                    dim.name, bit
                ));
            }
            if self.vary_mask(dim) == 0 {
                return invalid(format!("dimension {} varies no address bits", dim.name));
            }
        }
        Ok(())
    }

    /// The primary pool size.
    pub fn pool_size(&self) -> Size {
        Size::MB(self.pool_size_mb)
    }

    /// The fallback pool size, if configured.
    pub fn fallback_pool_size(&self) -> Option<Size> {
        self.fallback_pool_size_mb.map(Size::MB)
    }

    /// The overall timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Bits considered by the run.
    pub fn address_mask(&self) -> usize {
        bit_window(self.low_bit, self.address_bits)
    }

    /// Bits allowed to differ for `dim`, restricted to the considered address bits.
    pub fn vary_mask(&self, dim: &DimensionConfig) -> usize {
        dim.vary_mask.unwrap_or(usize::MAX) & self.address_mask()
    }

    /// Isolation for `dim` given the functions found for earlier groups.
    pub fn isolation(&self, dim: &DimensionConfig, previous: &[usize]) -> Isolation {
        let held = dim.hold.iter().map(BitDef::to_bitstr);
        let isolation = Isolation::new(self.vary_mask(dim)).holding(held);
        if dim.hold_previous {
            isolation.holding(previous.iter().copied())
        } else {
            isolation
        }
    }

    /// Calibration parameters.
    pub fn calibration_params(&self) -> CalibrationParams {
        CalibrationParams {
            pairs: self.calibration_pairs,
            repetitions: self.repetitions,
            min_separation: self.min_separation,
            low_bit: self.low_bit,
        }
    }

    /// Sampler parameters.
    pub fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            batch_size: self.batch_size,
            threads: self.threads,
            max_idle_draws: self.max_idle_draws,
            recheck_every: self.recheck_every,
            escalation_factor: self.escalation_factor,
            low_bit: self.low_bit,
        }
    }

    /// Solver parameters.
    pub fn solver_params(&self) -> SolverParams {
        SolverParams {
            noise_tolerance: self.noise_tolerance,
            max_function_weight: self.max_function_weight,
        }
    }

    /// Validator parameters.
    pub fn validator_params(&self) -> ValidatorParams {
        ValidatorParams {
            trials: self.validation_trials,
            tolerance: self.validation_tolerance,
        }
    }
}
