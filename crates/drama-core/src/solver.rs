//! Recovers address functions from labeled difference vectors.
//!
//! Two modes are supported:
//!
//! * **labeled**: the group consists of a single function. Every observation
//!   contributes the equation `parity(mask & d) == !conflict`.
//! * **composite**: the group consists of `count` functions that are only
//!   observed together ("same bank" means all of them agree). Conflicting
//!   differences contribute the homogeneous equations `parity(mask & d) == 0`,
//!   whose solution space is the span of the group's functions. The minimum
//!   weight basis of that span is reported.
//!
//! Which addresses were probed together is decided by the caller through the
//! sampler's isolation constraints; the solver itself is dimension-agnostic.

use log::{debug, warn};
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::function::{AddressFunction, DifferenceVector};
use crate::gf2::{Gf2System, Insertion};
use crate::util::Rng;

/// Elimination orders tried when the labels contradict each other.
const REORDER_TRIALS: usize = 64;
const REORDER_SEED: u64 = 0x9f2;

/// Errors recovering functions for one group.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    /// The evidence contradicts itself beyond the noise tolerance
    #[error(
        "inconsistent evidence: {contradictions} contradicting equations, {disagreement:.3} residual disagreement"
    )]
    InconsistentEvidence {
        /// Equations rejected during elimination
        contradictions: usize,
        /// Fraction of observations the best solution disagrees with
        disagreement: f64,
    },
    /// More candidate solutions remain than the group has functions
    #[error("underdetermined: {nullity} free dimensions for {expected} functions")]
    Underdetermined {
        /// Dimension of the remaining solution space
        nullity: u32,
        /// Number of functions sought
        expected: usize,
    },
    /// The only solution is the zero function
    #[error("the evidence only admits the zero function")]
    Redundant,
    /// No observations were supplied
    #[error("no evidence")]
    NoEvidence,
}

/// Tuning of the solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverParams {
    /// Fraction of observations allowed to disagree with the solution
    pub noise_tolerance: f64,
    /// Largest number of address bits a single function may use
    pub max_function_weight: u32,
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            noise_tolerance: 0.0,
            max_function_weight: 12,
        }
    }
}

/// Functions recovered for one group, with solver statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Minimum weight functions, in (weight, value) order
    pub functions: Vec<AddressFunction>,
    /// Whether the evidence admits exactly this solution
    pub determined: bool,
    /// Rank of the equation system
    pub rank: usize,
    /// Number of observations consumed
    pub observations: usize,
    /// Observations the solution disagrees with
    pub disagreements: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Labeled,
    Composite { count: usize },
}

/// Incremental solver for one group of functions.
///
/// Observations are fed one at a time with [`Solver::add`]; the row-echelon
/// state is updated on every insertion so that [`Solver::is_determined`] is
/// cheap to poll between sampling batches.
#[derive(Debug, Clone)]
pub struct Solver {
    mode: Mode,
    params: SolverParams,
    system: Gf2System,
    /// Union of all observed differences
    support: usize,
    evidence: Vec<(DifferenceVector, bool)>,
}

impl Solver {
    /// Solver for a group consisting of a single function.
    pub fn labeled(params: SolverParams) -> Self {
        Self::with_mode(Mode::Labeled, params)
    }

    /// Solver for a group of `count` functions observed through composite labels.
    pub fn composite(count: usize, params: SolverParams) -> Self {
        if count == 1 {
            return Self::labeled(params);
        }
        Self::with_mode(Mode::Composite { count }, params)
    }

    fn with_mode(mode: Mode, params: SolverParams) -> Self {
        Solver {
            mode,
            params,
            system: Gf2System::new(),
            support: 0,
            evidence: vec![],
        }
    }

    /// Adds one observation. `conflict` is true if the pair was measured as
    /// the same resource.
    pub fn add(&mut self, difference: DifferenceVector, conflict: bool) -> Option<Insertion> {
        let d = difference.bits();
        if d == 0 {
            return None;
        }
        self.support |= d;
        self.evidence.push((difference, conflict));
        match self.mode {
            Mode::Labeled => Some(self.system.insert(d, !conflict)),
            Mode::Composite { .. } if conflict => Some(self.system.insert(d, false)),
            Mode::Composite { .. } => None,
        }
    }

    /// Adds all observations of `evidence`.
    pub fn extend<I: IntoIterator<Item = (DifferenceVector, bool)>>(&mut self, evidence: I) {
        for (d, conflict) in evidence {
            self.add(d, conflict);
        }
    }

    /// Number of observations added.
    pub fn observations(&self) -> usize {
        self.evidence.len()
    }

    /// Rank of the equation system.
    pub fn rank(&self) -> usize {
        self.system.rank()
    }

    /// Whether the evidence pins the group's functions down uniquely.
    pub fn is_determined(&self) -> bool {
        match self.mode {
            Mode::Labeled => self.system.is_determined() && self.system.contradictions() == 0,
            Mode::Composite { count } => {
                self.support != 0 && self.system.nullity_within(self.support) as usize == count
            }
        }
    }

    /// Solves the group.
    ///
    /// # Errors
    ///
    /// * [`SolveError::NoEvidence`] if nothing was added
    /// * [`SolveError::InconsistentEvidence`] if contradictions or residual
    ///   disagreement exceed the noise tolerance
    /// * [`SolveError::Underdetermined`] if no function within the weight
    ///   limit fits, or a composite group has too much freedom left
    /// * [`SolveError::Redundant`] if only the zero function fits
    pub fn solve(&self) -> Result<Solution, SolveError> {
        if self.evidence.is_empty() {
            return Err(SolveError::NoEvidence);
        }
        match self.mode {
            Mode::Labeled => self.solve_labeled(),
            Mode::Composite { count } => self.solve_composite(count),
        }
    }

    fn inconsistent(&self, disagreements: usize) -> SolveError {
        SolveError::InconsistentEvidence {
            contradictions: self.system.contradictions(),
            disagreement: disagreements as f64 / self.evidence.len() as f64,
        }
    }

    fn within_tolerance(&self, count: usize, total: usize) -> bool {
        count == 0 || (count as f64) <= self.params.noise_tolerance * total as f64
    }

    /// Observations `mask` mispredicts.
    fn disagreements(&self, mask: usize) -> usize {
        let function = AddressFunction::new(mask);
        self.evidence
            .iter()
            .filter(|&&(d, conflict)| function.separates(d) == conflict)
            .count()
    }

    /// Minimum weight solution of `system` with its disagreement count.
    fn fit(&self, system: &Gf2System) -> Option<(usize, usize)> {
        let mask = system.min_weight_solution(self.params.max_function_weight)?;
        Some((mask, self.disagreements(mask)))
    }

    /// The solution with the fewest disagreements, then the fewest bits.
    ///
    /// Elimination keeps the first equations it sees as pivots, so a wrong
    /// label among them poisons the solution. With contradictions present the
    /// evidence is eliminated again in several pseudo-random orders and the
    /// best fit over all evidence wins.
    fn best_fit(&self) -> Option<(usize, usize)> {
        let mut best = self.fit(&self.system);
        if self.system.contradictions() == 0 {
            return best;
        }
        let mut equations: Vec<(usize, bool)> =
            self.evidence.iter().map(|&(d, conflict)| (d.bits(), !conflict)).collect();
        // independent of insertion order
        equations.sort_unstable();
        let mut rng = Rng::from_seed(REORDER_SEED);
        for _ in 0..REORDER_TRIALS {
            equations.shuffle(&mut rng);
            let mut system = Gf2System::new();
            for &(d, rhs) in &equations {
                system.insert(d, rhs);
            }
            let Some(candidate) = self.fit(&system) else {
                continue;
            };
            let key = |(mask, disagreements): (usize, usize)| (disagreements, mask.count_ones(), mask);
            if best.is_none_or(|b| key(candidate) < key(b)) {
                best = Some(candidate);
            }
        }
        best
    }

    fn solve_labeled(&self) -> Result<Solution, SolveError> {
        let (mask, disagreements) = self.best_fit().ok_or(SolveError::Underdetermined {
            nullity: self.system.nullity(),
            expected: 1,
        })?;
        if !self.within_tolerance(disagreements, self.evidence.len()) {
            return Err(self.inconsistent(disagreements));
        }
        if mask == 0 {
            return Err(SolveError::Redundant);
        }
        let function = AddressFunction::new(mask);
        if disagreements > 0 {
            warn!(
                "{} of {} observations disagree with {}",
                disagreements,
                self.evidence.len(),
                function
            );
        }
        debug!(
            "labeled solve: {} equations, {} contradictions, rank {}, nullity {}, solution {}",
            self.system.equations(),
            self.system.contradictions(),
            self.system.rank(),
            self.system.nullity(),
            function
        );
        Ok(Solution {
            functions: vec![function],
            determined: self.system.nullity() == 0,
            rank: self.system.rank(),
            observations: self.evidence.len(),
            disagreements,
        })
    }

    fn solve_composite(&self, count: usize) -> Result<Solution, SolveError> {
        let nullity = self.system.nullity_within(self.support);
        if (nullity as usize) < count {
            // conflicts rule out part of the span a full group needs
            return Err(self.inconsistent(0));
        }
        if nullity as usize > count {
            return Err(SolveError::Underdetermined {
                nullity,
                expected: count,
            });
        }
        let basis = self.system.min_weight_basis(
            self.support,
            count,
            self.params.max_function_weight,
        );
        if basis.len() < count {
            return Err(SolveError::Underdetermined {
                nullity,
                expected: count,
            });
        }
        let functions: Vec<_> = basis.into_iter().map(AddressFunction::new).collect();
        // every non-conflicting pair must be told apart by some function
        let disagreements = self
            .evidence
            .iter()
            .filter(|&&(d, conflict)| !conflict && !functions.iter().any(|f| f.separates(d)))
            .count();
        if !self.within_tolerance(disagreements, self.evidence.len()) {
            return Err(self.inconsistent(disagreements));
        }
        debug!(
            "composite solve: {} conflicts, rank {}, {} functions",
            self.system.equations(),
            self.system.rank(),
            functions.len()
        );
        Ok(Solution {
            functions,
            determined: true,
            rank: self.system.rank(),
            observations: self.evidence.len(),
            disagreements,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng as _;

    use super::*;
    use crate::util::{Rng, parity};

    const MASK: usize = 0b101000;

    fn random_differences(rng: &mut Rng, bits: u32, n: usize) -> Vec<DifferenceVector> {
        (0..n)
            .map(|_| DifferenceVector::from_bits(rng.random_range(1..1usize << bits)))
            .collect()
    }

    fn label(masks: &[usize], d: DifferenceVector) -> bool {
        masks.iter().all(|&m| !parity(m & d.bits()))
    }

    #[test]
    fn test_recovers_injected_mask() {
        let mut rng = Rng::from_seed(0xd7a);
        let mut solver = Solver::labeled(SolverParams::default());
        for d in random_differences(&mut rng, 16, 200) {
            solver.add(d, label(&[MASK], d));
        }
        assert!(solver.is_determined());
        let solution = solver.solve().expect("consistent evidence");
        assert_eq!(solution.functions, vec![AddressFunction::new(MASK)]);
        assert!(solution.determined);
        assert_eq!(solution.disagreements, 0);
    }

    #[test]
    fn test_solve_is_deterministic() {
        let mut rng = Rng::from_seed(3);
        // only a few observations, so the solution space is not unique
        let evidence: Vec<_> = random_differences(&mut rng, 16, 9)
            .into_iter()
            .map(|d| (d, label(&[MASK], d)))
            .collect();
        let mut a = Solver::labeled(SolverParams::default());
        a.extend(evidence.iter().copied());
        let mut b = Solver::labeled(SolverParams::default());
        b.extend(evidence.iter().rev().copied());
        assert_eq!(a.solve(), b.solve());
        assert_eq!(a.solve(), a.solve());
    }

    #[test]
    fn test_prefers_fewest_bits() {
        let mut solver = Solver::labeled(SolverParams::default());
        // either bit 3 or bit 5 separates the pair
        solver.add(DifferenceVector::from_bits(0b101000), false);
        let solution = solver.solve().expect("consistent");
        assert!(!solution.determined);
        assert_eq!(solution.functions, vec![AddressFunction::new(0b001000)]);
    }

    #[test]
    fn test_noise_tolerance() {
        let mut rng = Rng::from_seed(0xd7a);
        let mut evidence: Vec<_> = random_differences(&mut rng, 16, 200)
            .into_iter()
            .map(|d| (d, label(&[MASK], d)))
            .collect();
        // 2% flipped labels, after the system reached full rank
        for idx in [100, 150, 175, 199] {
            evidence[idx].1 = !evidence[idx].1;
        }
        let mut strict = Solver::labeled(SolverParams::default());
        strict.extend(evidence.iter().copied());
        assert!(matches!(
            strict.solve(),
            Err(SolveError::InconsistentEvidence { .. })
        ));

        let mut tolerant = Solver::labeled(SolverParams {
            noise_tolerance: 0.05,
            ..Default::default()
        });
        tolerant.extend(evidence.iter().copied());
        let solution = tolerant.solve().expect("within tolerance");
        assert_eq!(solution.functions, vec![AddressFunction::new(MASK)]);
        assert_eq!(solution.disagreements, 4);
    }

    #[test]
    fn test_noise_among_first_observations() {
        let mut rng = Rng::from_seed(0xd7a);
        let evidence: Vec<_> = random_differences(&mut rng, 16, 200)
            .into_iter()
            .map(|d| (d, label(&[MASK], d)))
            .collect();
        let params = SolverParams {
            noise_tolerance: 0.05,
            ..Default::default()
        };
        // wrong labels before the system reaches full rank end up as pivots
        for flipped in [vec![0], vec![0, 1, 2, 3], vec![3, 7, 11, 15]] {
            let mut noisy = evidence.clone();
            for &idx in &flipped {
                noisy[idx].1 = !noisy[idx].1;
            }
            let mut solver = Solver::labeled(params);
            solver.extend(noisy.iter().copied());
            let solution = solver.solve().expect("within tolerance");
            assert_eq!(solution.functions, vec![AddressFunction::new(MASK)]);
            assert_eq!(solution.disagreements, flipped.len());

            let mut reversed = Solver::labeled(params);
            reversed.extend(noisy.iter().rev().copied());
            assert_eq!(reversed.solve(), solver.solve());
        }
    }

    #[test]
    fn test_heavy_noise_is_inconsistent() {
        let mut rng = Rng::from_seed(11);
        let mut solver = Solver::labeled(SolverParams {
            noise_tolerance: 0.05,
            ..Default::default()
        });
        for (idx, d) in random_differences(&mut rng, 16, 200).into_iter().enumerate() {
            solver.add(d, label(&[MASK], d) ^ (idx % 5 == 0));
        }
        assert!(matches!(
            solver.solve(),
            Err(SolveError::InconsistentEvidence { .. })
        ));
    }

    #[test]
    fn test_no_evidence() {
        let solver = Solver::labeled(SolverParams::default());
        assert_eq!(solver.solve(), Err(SolveError::NoEvidence));
        let mut solver = Solver::composite(2, SolverParams::default());
        solver.add(DifferenceVector::from_bits(0), true);
        assert_eq!(solver.solve(), Err(SolveError::NoEvidence));
    }

    #[test]
    fn test_all_conflicts_is_redundant() {
        let mut solver = Solver::labeled(SolverParams::default());
        solver.add(DifferenceVector::from_bits(0b0110), true);
        solver.add(DifferenceVector::from_bits(0b1000), true);
        assert_eq!(solver.solve(), Err(SolveError::Redundant));
    }

    #[test]
    fn test_composite_recovers_group() {
        let masks = [(1 << 6) | (1 << 13), (1 << 7) | (1 << 14), 1 << 15];
        let mut rng = Rng::from_seed(5);
        let mut solver = Solver::composite(masks.len(), SolverParams::default());
        for d in random_differences(&mut rng, 16, 600) {
            solver.add(d, label(&masks, d));
        }
        assert!(solver.is_determined());
        let solution = solver.solve().expect("consistent");
        // the minimum weight basis of the span is the set of sparse functions itself
        let mut found: Vec<_> = solution.functions.iter().map(|f| f.mask()).collect();
        found.sort();
        let mut expected = masks.to_vec();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_composite_wrong_count() {
        let masks = [1 << 3, 1 << 9];
        let mut rng = Rng::from_seed(8);
        let evidence: Vec<_> = random_differences(&mut rng, 12, 400)
            .into_iter()
            .map(|d| (d, label(&masks, d)))
            .collect();
        let mut too_few = Solver::composite(3, SolverParams::default());
        too_few.extend(evidence.iter().copied());
        assert!(matches!(
            too_few.solve(),
            Err(SolveError::InconsistentEvidence { .. })
        ));
        let mut too_many = Solver::composite(1, SolverParams::default());
        too_many.extend(evidence.iter().copied());
        assert!(too_many.solve().is_err());
    }
}
