//! Timing oracle: labels address pairs as row conflicts by their access latency.
//!
//! The oracle is abstracted behind [`TimingOracle`] with a hardware-backed
//! implementation ([`HardwareOracle`]) and a deterministic implementation
//! driven by known functions ([`SyntheticOracle`]). The latency threshold is
//! an explicit value produced by [`calibrate`] and threaded through all
//! subsequent calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, trace};
use rand::Rng as _;
use serde::Serialize;
use thiserror::Error;

use crate::memory::{
    AddressPool, MemoryTupleTimer, PhysAddr, TimerError, construct_memory_tuple_timer, median,
};
use crate::util::{CL_SHIFT, Rng, parity};

/// Errors of the timing oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Conflict and non-conflict latencies do not separate
    #[error("calibration failed: {0}")]
    CalibrationFailed(String),
    /// The address has no virtual backing in the pool
    #[error("address {0:?} is not mapped by the pool")]
    UnmappedAddress(PhysAddr),
    /// No cycle counter available
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Latency threshold separating row conflicts from other accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Threshold {
    /// Latencies above this many cycles are conflicts
    pub cycles: u64,
    /// Median latency of the non-conflict class during calibration
    pub low_median: u64,
    /// Median latency of the conflict class during calibration
    pub high_median: u64,
    /// Rounds per measurement
    pub repetitions: usize,
}

impl Threshold {
    /// Labels a measured latency.
    pub fn label(&self, latency: u64) -> ConflictLabel {
        let half_gap = (self.high_median.saturating_sub(self.low_median) as f64 / 2.0).max(1.0);
        let distance = (latency as f64 - self.cycles as f64).abs();
        ConflictLabel {
            conflict: latency > self.cycles,
            latency,
            confidence: (distance / half_gap).min(1.0),
        }
    }

    /// The same threshold measured with `factor` times the repetitions.
    pub fn escalated(&self, factor: usize) -> Threshold {
        Threshold {
            repetitions: self.repetitions.saturating_mul(factor.max(1)),
            ..*self
        }
    }
}

/// Classification of an address pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConflictLabel {
    /// True if both addresses map to the same bank but different rows
    pub conflict: bool,
    /// Median latency in cycles
    pub latency: u64,
    /// Distance from the threshold relative to half the calibrated gap (0.0-1.0)
    pub confidence: f64,
}

/// Measures address pairs.
pub trait TimingOracle: Sync {
    /// Returns the median latency of `repetitions` back-to-back rounds accessing `a` and `b`.
    ///
    /// # Errors
    ///
    /// Fails if an address cannot be accessed.
    fn measure(&self, a: PhysAddr, b: PhysAddr, repetitions: usize) -> Result<u64, OracleError>;

    /// Measures the pair with the threshold's repetition count and labels it.
    ///
    /// # Errors
    ///
    /// See [`TimingOracle::measure`].
    fn classify(
        &self,
        a: PhysAddr,
        b: PhysAddr,
        threshold: &Threshold,
    ) -> Result<ConflictLabel, OracleError> {
        let latency = self.measure(a, b, threshold.repetitions)?;
        let label = threshold.label(latency);
        trace!("{:?} {:?}: {:?}", a, b, label);
        Ok(label)
    }
}

/// Calibration tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParams {
    /// Number of random pairs to measure
    pub pairs: usize,
    /// Rounds per measurement
    pub repetitions: usize,
    /// Minimum relative gap `(high - low) / low` between the class medians
    pub min_separation: f64,
    /// Addresses are aligned to `1 << low_bit`
    pub low_bit: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        CalibrationParams {
            pairs: 2000,
            repetitions: 100,
            min_separation: 0.1,
            low_bit: CL_SHIFT,
        }
    }
}

/// Measures random pairs from `pool` and picks the threshold separating the
/// two latency modes.
///
/// Latencies are split where the between-class variance is maximal; the
/// threshold is the midpoint between the medians of both classes.
///
/// # Errors
///
/// Returns [`OracleError::CalibrationFailed`] if a class is (nearly) empty or
/// the medians are closer than `min_separation`.
pub fn calibrate(
    pool: &dyn AddressPool,
    oracle: &dyn TimingOracle,
    params: &CalibrationParams,
    rng: &mut Rng,
) -> Result<Threshold, OracleError> {
    info!(
        "Calibrating with {} pairs of {} rounds",
        params.pairs, params.repetitions
    );
    let mut latencies = Vec::with_capacity(params.pairs);
    for _ in 0..params.pairs {
        let a = pool.random_addr(rng, params.low_bit);
        let b = pool.random_addr(rng, params.low_bit);
        if a == b {
            continue;
        }
        latencies.push(oracle.measure(a, b, params.repetitions)?);
    }
    latencies.sort_unstable();
    let split = otsu_split(&latencies);
    let (low, high) = latencies.split_at(split);
    let min_class = (latencies.len() / 200).max(3);
    if low.len() < min_class || high.len() < min_class {
        return Err(OracleError::CalibrationFailed(format!(
            "latencies are unimodal ({} low, {} high samples)",
            low.len(),
            high.len()
        )));
    }
    let low_median = median(&mut low.to_vec());
    let high_median = median(&mut high.to_vec());
    let separation = (high_median - low_median) as f64 / low_median.max(1) as f64;
    debug!(
        "low class {} samples (median {}), high class {} samples (median {}), separation {:.3}",
        low.len(),
        low_median,
        high.len(),
        high_median,
        separation
    );
    if separation < params.min_separation {
        return Err(OracleError::CalibrationFailed(format!(
            "class medians {} and {} differ by {:.3}, below {:.3}",
            low_median, high_median, separation, params.min_separation
        )));
    }
    let threshold = Threshold {
        cycles: (low_median + high_median) / 2,
        low_median,
        high_median,
        repetitions: params.repetitions,
    };
    info!("Threshold: {} cycles", threshold.cycles);
    Ok(threshold)
}

/// Index splitting sorted `values` into two classes with maximal between-class variance.
fn otsu_split(values: &[u64]) -> usize {
    let n = values.len();
    let total: f64 = values.iter().map(|&v| v as f64).sum();
    let mut below = 0.0;
    let mut best = (0.0, 0);
    for i in 1..n {
        below += values[i - 1] as f64;
        if values[i] == values[i - 1] {
            continue;
        }
        let (w0, w1) = (i as f64, (n - i) as f64);
        let m0 = below / w0;
        let m1 = (total - below) / w1;
        let variance = w0 * w1 * (m0 - m1) * (m0 - m1);
        if variance > best.0 {
            best = (variance, i);
        }
    }
    best.1
}

/// Oracle measuring real DRAM latencies of pool memory.
pub struct HardwareOracle<'p> {
    pool: &'p dyn AddressPool,
    timer: Box<dyn MemoryTupleTimer>,
}

impl<'p> HardwareOracle<'p> {
    /// Creates an oracle using the platform's cycle counter.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Timer`] if no timer is available.
    pub fn new(pool: &'p dyn AddressPool) -> Result<Self, OracleError> {
        Ok(Self::with_timer(pool, construct_memory_tuple_timer()?))
    }

    /// Creates an oracle using `timer`.
    pub fn with_timer(pool: &'p dyn AddressPool, timer: Box<dyn MemoryTupleTimer>) -> Self {
        HardwareOracle { pool, timer }
    }
}

impl TimingOracle for HardwareOracle<'_> {
    fn measure(&self, a: PhysAddr, b: PhysAddr, repetitions: usize) -> Result<u64, OracleError> {
        let va = self.pool.virt(a).ok_or(OracleError::UnmappedAddress(a))?;
        let vb = self.pool.virt(b).ok_or(OracleError::UnmappedAddress(b))?;
        // SAFETY: the pool keeps both pages mapped while it is borrowed
        Ok(unsafe {
            self.timer
                .time_subsequent_access_from_ram(va, vb, repetitions.max(1))
        })
    }
}

/// Oracle answering from known address functions.
///
/// A pair conflicts iff it differs and no function separates it. Each round
/// is flipped to the opposite latency with `flip_probability`; the median over
/// all rounds is returned, as for real measurements.
#[derive(Debug)]
pub struct SyntheticOracle {
    functions: Vec<usize>,
    hit_latency: u64,
    conflict_latency: u64,
    flip_probability: f64,
    rng: Mutex<Rng>,
    measurements: AtomicUsize,
}

impl SyntheticOracle {
    /// Noise-free oracle for the given function masks.
    pub fn new(functions: Vec<usize>) -> Self {
        SyntheticOracle {
            functions,
            hit_latency: 250,
            conflict_latency: 400,
            flip_probability: 0.0,
            rng: Mutex::new(Rng::from_seed(0)),
            measurements: AtomicUsize::new(0),
        }
    }

    /// Flips each round with probability `p`, drawing from a stream seeded with `seed`.
    pub fn with_noise(mut self, p: f64, seed: u64) -> Self {
        self.flip_probability = p.clamp(0.0, 1.0);
        self.rng = Mutex::new(Rng::from_seed(seed));
        self
    }

    /// Sets the latencies of non-conflicting and conflicting pairs.
    pub fn with_latencies(mut self, hit: u64, conflict: u64) -> Self {
        self.hit_latency = hit;
        self.conflict_latency = conflict;
        self
    }

    /// Whether `a` and `b` conflict according to the injected functions.
    pub fn conflicts(&self, a: PhysAddr, b: PhysAddr) -> bool {
        let d = a.as_usize() ^ b.as_usize();
        d != 0 && self.functions.iter().all(|&f| !parity(f & d))
    }

    /// Number of `measure` calls so far.
    pub fn measurements(&self) -> usize {
        self.measurements.load(Ordering::Relaxed)
    }
}

impl TimingOracle for SyntheticOracle {
    fn measure(&self, a: PhysAddr, b: PhysAddr, repetitions: usize) -> Result<u64, OracleError> {
        self.measurements.fetch_add(1, Ordering::Relaxed);
        let conflict = self.conflicts(a, b);
        let latency = |conflict: bool| {
            if conflict {
                self.conflict_latency
            } else {
                self.hit_latency
            }
        };
        if self.flip_probability <= 0.0 {
            return Ok(latency(conflict));
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut rounds: Vec<u64> = (0..repetitions.max(1))
            .map(|_| latency(conflict ^ rng.random_bool(self.flip_probability)))
            .collect();
        Ok(median(&mut rounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SyntheticPool;

    const BANK_FUNCTIONS: [usize; 4] = [
        (1 << 6) | (1 << 13),
        (1 << 14) | (1 << 17),
        (1 << 15) | (1 << 18),
        (1 << 16) | (1 << 19),
    ];

    #[test]
    fn test_calibrate_separates_modes() -> anyhow::Result<()> {
        let pool = SyntheticPool::new(0, 20);
        let oracle = SyntheticOracle::new(BANK_FUNCTIONS.to_vec()).with_noise(0.05, 1);
        let mut rng = Rng::from_seed(42);
        let threshold = calibrate(&pool, &oracle, &CalibrationParams::default(), &mut rng)?;
        assert_eq!(threshold.low_median, 250);
        assert_eq!(threshold.high_median, 400);
        assert_eq!(threshold.cycles, 325);
        assert_eq!(threshold.repetitions, 100);
        Ok(())
    }

    #[test]
    fn test_calibrate_fails_without_conflicts() {
        let pool = SyntheticPool::new(0, 20);
        // every pair conflicts: a single latency mode
        let oracle = SyntheticOracle::new(vec![]);
        let mut rng = Rng::from_seed(42);
        let result = calibrate(&pool, &oracle, &CalibrationParams::default(), &mut rng);
        assert!(matches!(result, Err(OracleError::CalibrationFailed(_))));
    }

    #[test]
    fn test_calibrate_fails_on_small_gap() {
        let pool = SyntheticPool::new(0, 20);
        let oracle = SyntheticOracle::new(BANK_FUNCTIONS.to_vec()).with_latencies(250, 260);
        let mut rng = Rng::from_seed(42);
        let result = calibrate(&pool, &oracle, &CalibrationParams::default(), &mut rng);
        assert!(matches!(result, Err(OracleError::CalibrationFailed(_))));
    }

    #[test]
    fn test_label_confidence() {
        let threshold = Threshold {
            cycles: 325,
            low_median: 250,
            high_median: 400,
            repetitions: 10,
        };
        let label = threshold.label(400);
        assert!(label.conflict);
        assert_eq!(label.confidence, 1.0);
        let label = threshold.label(300);
        assert!(!label.conflict);
        assert!((label.confidence - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(threshold.escalated(4).repetitions, 40);
    }

    #[test]
    fn test_repeated_classification_converges() -> anyhow::Result<()> {
        let oracle = SyntheticOracle::new(BANK_FUNCTIONS.to_vec()).with_noise(0.1, 7);
        let threshold = Threshold {
            cycles: 325,
            low_median: 250,
            high_median: 400,
            repetitions: 31,
        };
        let a = PhysAddr::new(0x4_0000);
        for b in [a ^ (1 << 20), a ^ (1 << 13)] {
            let expected = oracle.conflicts(a, b);
            for _ in 0..50 {
                assert_eq!(oracle.classify(a, b, &threshold)?.conflict, expected);
            }
        }
        Ok(())
    }

    #[test]
    fn test_otsu_split() {
        let values = [10, 11, 12, 11, 50, 52, 51];
        let mut sorted = values.to_vec();
        sorted.sort();
        assert_eq!(otsu_split(&sorted), 4);
        assert_eq!(otsu_split(&[7, 7, 7]), 0);
    }
}
