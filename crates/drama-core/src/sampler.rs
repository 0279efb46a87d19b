//! Conflict set sampling.
//!
//! The [`Sampler`] draws address pairs whose difference lies in the subspace
//! allowed by an [`Isolation`], labels them with the timing oracle and appends
//! the results to an [`ObservationLog`]. Each difference is measured once;
//! repeated differences are skipped, except for periodic spot checks that
//! trigger a re-measurement with more repetitions when the label changed.

use std::collections::{HashMap, HashSet};

use log::{debug, trace, warn};
use rand::Rng as _;
use serde::Serialize;
use thiserror::Error;

use crate::function::DifferenceVector;
use crate::gf2::Gf2System;
use crate::memory::{AddressPool, PhysAddr};
use crate::oracle::{ConflictLabel, OracleError, Threshold, TimingOracle};
use crate::util::{Rng, available_cores, bit_window, format_bits, parity, pin_to_core};

/// Errors while sampling.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The pool cannot produce enough distinct differences
    #[error(
        "pool exhausted after {collected} of {target} distinct differences, a larger pool is required"
    )]
    InsufficientAddressSpace {
        /// Distinct differences collected
        collected: usize,
        /// Distinct differences requested
        target: usize,
    },
    /// Measurement failed
    #[error(transparent)]
    Oracle(#[from] OracleError),
    /// The run was cancelled between batches
    #[error("sampling cancelled")]
    Cancelled,
}

/// One labeled address pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    /// First address
    pub a: PhysAddr,
    /// Second address
    pub b: PhysAddr,
    /// `a ^ b`
    pub difference: DifferenceVector,
    /// Measured label
    pub label: ConflictLabel,
    /// Rounds the label was measured with
    pub repetitions: usize,
}

/// Append-only collection of observations.
///
/// A difference may be observed more than once when it was re-measured. The
/// entry with the most repetitions wins; on a tie the latest one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservationLog {
    entries: Vec<Observation>,
    #[serde(skip)]
    best: HashMap<DifferenceVector, usize>,
    /// Distinct differences in order of first appearance
    #[serde(skip)]
    order: Vec<DifferenceVector>,
}

impl ObservationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observation.
    pub fn push(&mut self, observation: Observation) {
        let idx = self.entries.len();
        self.entries.push(observation);
        match self.best.get(&observation.difference) {
            None => {
                self.order.push(observation.difference);
                self.best.insert(observation.difference, idx);
            }
            Some(&prev) if self.entries[prev].repetitions <= observation.repetitions => {
                self.best.insert(observation.difference, idx);
            }
            Some(_) => {}
        }
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[Observation] {
        &self.entries
    }

    /// Number of entries, including re-measurements.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct differences.
    pub fn distinct(&self) -> usize {
        self.order.len()
    }

    /// Whether `d` has been observed.
    pub fn contains(&self, d: DifferenceVector) -> bool {
        self.best.contains_key(&d)
    }

    /// The authoritative observation of `d`.
    pub fn get(&self, d: DifferenceVector) -> Option<&Observation> {
        self.best.get(&d).map(|&idx| &self.entries[idx])
    }

    /// One `(difference, conflict)` pair per distinct difference, in order of first appearance.
    pub fn evidence(&self) -> impl Iterator<Item = (DifferenceVector, bool)> + '_ {
        self.order
            .iter()
            .filter_map(|d| self.get(*d))
            .map(|o| (o.difference, o.label.conflict))
    }
}

/// Constraints on the differences sampled for one group of functions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Isolation {
    /// Bits allowed to differ between the two addresses of a pair
    pub vary_mask: usize,
    /// Functions both addresses must agree on
    pub hold: Vec<usize>,
}

impl Isolation {
    /// Pairs may differ in the bits of `vary_mask`.
    pub fn new(vary_mask: usize) -> Self {
        Isolation {
            vary_mask,
            hold: vec![],
        }
    }

    /// Additionally requires both addresses to agree on `functions`.
    pub fn holding<I: IntoIterator<Item = usize>>(mut self, functions: I) -> Self {
        self.hold.extend(functions);
        self
    }

    /// Whether a pair with difference `d` satisfies the constraints.
    pub fn admits(&self, d: DifferenceVector) -> bool {
        d.bits() & !self.vary_mask == 0 && self.hold.iter().all(|&h| !parity(h & d.bits()))
    }

    /// Basis of the admissible differences that stay within `support`.
    pub fn subspace(&self, support: usize) -> Vec<usize> {
        let support = support & self.vary_mask;
        let mut system = Gf2System::new();
        for &h in &self.hold {
            system.insert(h & support, false);
        }
        system.null_space(support)
    }
}

/// Sampler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerParams {
    /// New differences measured per batch
    pub batch_size: usize,
    /// Measurement threads; 1 measures on the calling thread
    pub threads: usize,
    /// Consecutive draws without a new difference before the pool counts as exhausted
    pub max_idle_draws: usize,
    /// Every n-th repeated difference is measured again; 0 disables spot checks
    pub recheck_every: usize,
    /// Repetition multiplier for re-measuring a difference whose label changed
    pub escalation_factor: usize,
    /// Lowest address bit allowed to differ
    pub low_bit: usize,
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams {
            batch_size: 64,
            threads: 1,
            max_idle_draws: 10_000,
            recheck_every: 16,
            escalation_factor: 4,
            low_bit: 6,
        }
    }
}

/// Counters of a sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    /// Pairs drawn
    pub draws: usize,
    /// Draws whose difference was already known
    pub duplicates: usize,
    /// Repeated differences measured again
    pub rechecks: usize,
    /// Rechecks that disagreed and were re-measured with more repetitions
    pub escalations: usize,
}

/// Draws labeled address pairs for one group of functions.
pub struct Sampler<'a> {
    pool: &'a dyn AddressPool,
    oracle: &'a dyn TimingOracle,
    threshold: Threshold,
    params: SamplerParams,
    basis: Vec<usize>,
    /// Row space of `basis`, to tell which known differences lie in the subspace
    span: Gf2System,
    /// Next basis vector for sparse draws
    cursor: usize,
    /// Known differences that are never re-measured
    frozen: HashSet<DifferenceVector>,
    stats: SamplerStats,
}

/// Every n-th draw is a sparse combination of basis vectors.
const SPARSE_EVERY: usize = 4;

impl<'a> Sampler<'a> {
    /// Creates a sampler drawing differences admitted by `isolation` from the
    /// pool's contiguous window.
    pub fn new(
        pool: &'a dyn AddressPool,
        oracle: &'a dyn TimingOracle,
        threshold: Threshold,
        isolation: &Isolation,
        params: SamplerParams,
    ) -> Self {
        let low = bit_window(params.low_bit, usize::BITS as usize);
        let outside = isolation.vary_mask & low & !pool.window();
        if outside != 0 {
            warn!(
                "Bits {} are outside of the pool's contiguous window and will not be sampled",
                format_bits(outside)
            );
        }
        let basis = isolation.subspace(pool.window() & low);
        debug!(
            "Sampling subspace of dimension {} (vary {}, {} held functions)",
            basis.len(),
            format_bits(isolation.vary_mask & low),
            isolation.hold.len()
        );
        let mut span = Gf2System::new();
        for &v in &basis {
            span.insert(v, false);
        }
        Sampler {
            pool,
            oracle,
            threshold,
            params,
            basis,
            span,
            cursor: 0,
            frozen: HashSet::new(),
            stats: SamplerStats::default(),
        }
    }

    /// Excludes every difference of `log` from spot rechecks.
    pub fn freeze(mut self, log: &ObservationLog) -> Self {
        self.frozen.extend(log.entries().iter().map(|o| o.difference));
        self
    }

    /// Dimension of the sampled difference subspace.
    pub fn dimension(&self) -> usize {
        self.basis.len()
    }

    /// Number of distinct non-zero differences the subspace contains.
    pub fn capacity(&self) -> usize {
        1usize
            .checked_shl(self.basis.len() as u32)
            .map_or(usize::MAX, |n| n - 1)
    }

    /// Counters so far.
    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    fn draw_difference(&mut self, rng: &mut Rng) -> usize {
        let n = self.basis.len();
        if n == 0 {
            return 0;
        }
        if self.stats.draws % SPARSE_EVERY == 0 {
            // round robin over the basis, pure vectors on the first pass
            let first = self.basis[self.cursor % n];
            let mixed = self.cursor >= n && rng.random_bool(0.5);
            self.cursor += 1;
            let d = if mixed {
                first ^ self.basis[rng.random_range(0..n)]
            } else {
                first
            };
            return if d == 0 { first } else { d };
        }
        let sel = rng.random::<u64>() & self.selection_mask();
        (0..n)
            .filter(|&i| sel >> i & 1 == 1)
            .fold(0, |d, i| d ^ self.basis[i])
    }

    fn selection_mask(&self) -> u64 {
        1u64.checked_shl(self.basis.len() as u32)
            .map_or(u64::MAX, |n| n - 1)
    }

    /// Draws a pair with difference in the subspace, or `None` if the second
    /// address falls outside the pool.
    fn draw_pair(&mut self, rng: &mut Rng) -> Option<(PhysAddr, PhysAddr)> {
        self.stats.draws += 1;
        let d = self.draw_difference(rng);
        if d == 0 {
            return None;
        }
        let a = self.pool.random_addr(rng, self.params.low_bit);
        let b = a ^ d;
        self.pool.contains(b).then_some((a, b))
    }

    /// Samples until `log` holds `target` distinct differences.
    ///
    /// # Errors
    ///
    /// * [`SampleError::InsufficientAddressSpace`] if the subspace or the pool
    ///   cannot provide `target` distinct differences
    /// * [`SampleError::Oracle`] if a measurement fails
    pub fn sample(
        &mut self,
        log: &mut ObservationLog,
        target: usize,
        rng: &mut Rng,
    ) -> Result<(), SampleError> {
        while log.distinct() < target {
            self.sample_batch(log, target, rng)?;
        }
        Ok(())
    }

    /// Measures up to one batch of new differences and returns how many were added.
    ///
    /// # Errors
    ///
    /// See [`Sampler::sample`].
    pub fn sample_batch(
        &mut self,
        log: &mut ObservationLog,
        target: usize,
        rng: &mut Rng,
    ) -> Result<usize, SampleError> {
        let want = target
            .saturating_sub(log.distinct())
            .min(self.params.batch_size.max(1));
        let known = log
            .evidence()
            .filter(|(d, _)| self.span.in_row_space(d.bits()))
            .count();
        let available = self.capacity().saturating_sub(known);
        let mut pending: Vec<(PhysAddr, PhysAddr)> = vec![];
        let mut seen = HashSet::new();
        let mut rechecks = vec![];
        let mut idle = 0;
        while pending.len() < want.min(available) && idle <= self.params.max_idle_draws {
            let Some((a, b)) = self.draw_pair(rng) else {
                idle += 1;
                continue;
            };
            let d = DifferenceVector::of(a, b);
            if log.contains(d) || !seen.insert(d) {
                idle += 1;
                self.stats.duplicates += 1;
                if self.params.recheck_every > 0
                    && self.stats.duplicates % self.params.recheck_every == 0
                    && log.contains(d)
                    && !self.frozen.contains(&d)
                {
                    rechecks.push((a, b));
                }
                continue;
            }
            idle = 0;
            pending.push((a, b));
        }

        let labels = self.measure_all(&pending, &self.threshold)?;
        for (&(a, b), label) in pending.iter().zip(labels) {
            log.push(Observation {
                a,
                b,
                difference: DifferenceVector::of(a, b),
                label,
                repetitions: self.threshold.repetitions,
            });
        }
        self.recheck(log, &rechecks)?;

        let added = pending.len();
        trace!("batch added {} differences, {} total", added, log.distinct());
        if log.distinct() < target && (added == 0 || added < want.min(self.params.batch_size)) {
            return Err(SampleError::InsufficientAddressSpace {
                collected: log.distinct(),
                target,
            });
        }
        Ok(added)
    }

    /// Measures repeated differences again and escalates on disagreement.
    fn recheck(
        &mut self,
        log: &mut ObservationLog,
        pairs: &[(PhysAddr, PhysAddr)],
    ) -> Result<(), SampleError> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.stats.rechecks += pairs.len();
        let labels = self.measure_all(pairs, &self.threshold)?;
        let escalated = self.threshold.escalated(self.params.escalation_factor);
        let mut disputed = vec![];
        for (&(a, b), label) in pairs.iter().zip(labels) {
            let d = DifferenceVector::of(a, b);
            if log.get(d).is_some_and(|o| o.label.conflict != label.conflict) {
                disputed.push((a, b));
            }
        }
        if disputed.is_empty() {
            return Ok(());
        }
        warn!(
            "{} differences changed their label, re-measuring with {} rounds",
            disputed.len(),
            escalated.repetitions
        );
        self.stats.escalations += disputed.len();
        let labels = self.measure_all(&disputed, &escalated)?;
        for (&(a, b), label) in disputed.iter().zip(labels) {
            log.push(Observation {
                a,
                b,
                difference: DifferenceVector::of(a, b),
                label,
                repetitions: escalated.repetitions,
            });
        }
        Ok(())
    }

    /// Classifies `pairs`, in parallel on pinned threads if configured.
    fn measure_all(
        &self,
        pairs: &[(PhysAddr, PhysAddr)],
        threshold: &Threshold,
    ) -> Result<Vec<ConflictLabel>, OracleError> {
        let oracle = self.oracle;
        if self.params.threads <= 1 || pairs.len() < 2 {
            return pairs
                .iter()
                .map(|&(a, b)| oracle.classify(a, b, threshold))
                .collect();
        }
        let threads = self.params.threads.min(pairs.len());
        let chunk = pairs.len().div_ceil(threads);
        let cores = available_cores();
        std::thread::scope(|s| {
            let handles: Vec<_> = pairs
                .chunks(chunk)
                .enumerate()
                .map(|(i, chunk)| {
                    s.spawn(move || {
                        if let Err(e) = pin_to_core(i % cores) {
                            warn!("Failed to pin measurement thread to core {}: {}", i % cores, e);
                        }
                        chunk
                            .iter()
                            .map(|&(a, b)| oracle.classify(a, b, threshold))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();
            let mut labels = Vec::with_capacity(pairs.len());
            for handle in handles {
                match handle.join() {
                    Ok(chunk) => labels.extend(chunk?),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(labels)
        })
    }
}
