//! Incremental Gaussian elimination over GF(2).
//!
//! Unknowns are the bits of an address-width mask `x`; every equation states
//! `parity(coeffs & x) == rhs`. Rows are kept in reduced row-echelon form,
//! indexed by their pivot bit, so inserting an equation costs at most one
//! pass over the existing rows.

use itertools::Itertools;
use log::trace;

use crate::util::{bit_positions, parity};

/// Largest nullity for which the solution space is enumerated exhaustively.
pub const MAX_ENUM_NULLITY: u32 = 20;

const WIDTH: usize = usize::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Row {
    coeffs: usize,
    rhs: bool,
}

/// Result of inserting one equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The equation increased the rank; its pivot is the given bit
    Independent {
        /// Pivot bit of the new row
        pivot: usize,
    },
    /// The equation is implied by the existing rows
    Redundant,
    /// The equation reduces to `0 = 1`; it was not added
    Contradiction,
}

/// A system of linear equations over GF(2) in reduced row-echelon form.
#[derive(Debug, Clone)]
pub struct Gf2System {
    rows: Vec<Row>,
    /// Row index for each pivot bit
    pivot_row: [Option<usize>; WIDTH],
    pivots: usize,
    exercised: usize,
    equations: usize,
    contradictions: usize,
}

impl Default for Gf2System {
    fn default() -> Self {
        Self::new()
    }
}

impl Gf2System {
    /// Creates an empty system.
    pub fn new() -> Self {
        Gf2System {
            rows: vec![],
            pivot_row: [None; WIDTH],
            pivots: 0,
            exercised: 0,
            equations: 0,
            contradictions: 0,
        }
    }

    fn reduce(&self, mut coeffs: usize, mut rhs: bool) -> (usize, bool) {
        for bit in bit_positions(coeffs & self.pivots) {
            if let Some(idx) = self.pivot_row[bit] {
                let row = self.rows[idx];
                coeffs ^= row.coeffs;
                rhs ^= row.rhs;
            }
        }
        (coeffs, rhs)
    }

    /// Adds the equation `parity(coeffs & x) == rhs`.
    pub fn insert(&mut self, coeffs: usize, rhs: bool) -> Insertion {
        self.equations += 1;
        self.exercised |= coeffs;
        let (coeffs, rhs) = self.reduce(coeffs, rhs);
        if coeffs == 0 {
            if rhs {
                self.contradictions += 1;
                trace!("contradiction after {} equations", self.equations);
                return Insertion::Contradiction;
            }
            return Insertion::Redundant;
        }
        let pivot = WIDTH - 1 - coeffs.leading_zeros() as usize;
        let new = Row { coeffs, rhs };
        for row in self.rows.iter_mut() {
            if row.coeffs & (1 << pivot) != 0 {
                row.coeffs ^= new.coeffs;
                row.rhs ^= new.rhs;
            }
        }
        self.pivot_row[pivot] = Some(self.rows.len());
        self.pivots |= 1 << pivot;
        self.rows.push(new);
        Insertion::Independent { pivot }
    }

    /// Number of independent equations.
    pub fn rank(&self) -> usize {
        self.rows.len()
    }

    /// Union of all coefficient masks seen, i.e., the unknowns the evidence touches.
    pub fn exercised(&self) -> usize {
        self.exercised
    }

    /// Mask of pivot bits.
    pub fn pivots(&self) -> usize {
        self.pivots
    }

    /// Number of equations inserted, including rejected ones.
    pub fn equations(&self) -> usize {
        self.equations
    }

    /// Number of equations rejected as contradictory.
    pub fn contradictions(&self) -> usize {
        self.contradictions
    }

    /// Number of free unknowns among the exercised bits.
    pub fn nullity(&self) -> u32 {
        self.nullity_within(self.exercised)
    }

    /// Number of free unknowns among the bits of `support`.
    pub fn nullity_within(&self, support: usize) -> u32 {
        (support & !self.pivots).count_ones()
    }

    /// Whether the exercised unknowns have a unique solution.
    pub fn is_determined(&self) -> bool {
        self.exercised != 0 && self.nullity() == 0
    }

    /// Whether `v` is a linear combination of the coefficient rows.
    pub fn in_row_space(&self, v: usize) -> bool {
        self.reduce(v, false).0 == 0
    }

    /// Whether `x` satisfies every equation.
    pub fn satisfies(&self, x: usize) -> bool {
        self.rows.iter().all(|row| parity(row.coeffs & x) == row.rhs)
    }

    /// The solution with all free unknowns set to zero.
    pub fn particular_solution(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.rhs)
            .map(|row| 1usize << (WIDTH - 1 - row.coeffs.leading_zeros() as usize))
            .fold(0, |x, bit| x | bit)
    }

    /// Basis of the homogeneous solutions restricted to the unknowns in `support`.
    ///
    /// Rows must only involve bits of `support`; bits outside it are held at zero.
    pub fn null_space(&self, support: usize) -> Vec<usize> {
        let free = support & !self.pivots;
        bit_positions(free)
            .map(|f| {
                self.rows
                    .iter()
                    .filter(|row| row.coeffs & (1 << f) != 0)
                    .map(|row| 1usize << (WIDTH - 1 - row.coeffs.leading_zeros() as usize))
                    .fold(1usize << f, |v, bit| v | bit)
            })
            .collect()
    }

    /// The solution of minimum Hamming weight over the exercised unknowns.
    ///
    /// Ties are broken towards the numerically smallest mask, so the result
    /// only depends on the solution space, not on insertion order. Returns
    /// `None` if the search exceeds `max_weight` without finding a solution.
    pub fn min_weight_solution(&self, max_weight: u32) -> Option<usize> {
        let basis = self.null_space(self.exercised);
        let particular = self.particular_solution();
        if basis.len() as u32 <= MAX_ENUM_NULLITY {
            let best = affine_span(particular, &basis)
                .min_by_key(|&x| (x.count_ones(), x))
                .unwrap_or(particular);
            return (best.count_ones() <= max_weight).then_some(best);
        }
        let bits = bit_positions(self.exercised).collect_vec();
        (0..=max_weight as usize).find_map(|w| {
            bits.iter()
                .combinations(w)
                .map(|c| c.into_iter().fold(0usize, |x, &b| x | (1 << b)))
                .filter(|&x| self.satisfies(x))
                .min()
        })
    }

    /// Minimum-weight basis of the homogeneous solution space over the unknowns in `support`.
    ///
    /// Returns up to `count` linearly independent solutions, chosen greedily in
    /// (weight, value) order, which yields a basis of minimum total weight.
    pub fn min_weight_basis(&self, support: usize, count: usize, max_weight: u32) -> Vec<usize> {
        debug_assert!(self.rows.iter().all(|row| !row.rhs), "system is not homogeneous");
        let basis = self.null_space(support);
        let mut chosen = Gf2System::new();
        let mut out = vec![];
        let mut take = |v: usize, out: &mut Vec<usize>| {
            if out.len() < count && v != 0 && !chosen.in_row_space(v) {
                chosen.insert(v, false);
                out.push(v);
            }
        };
        if basis.len() as u32 <= MAX_ENUM_NULLITY {
            let candidates = affine_span(0, &basis)
                .filter(|&v| v != 0 && v.count_ones() <= max_weight)
                .sorted_by_key(|&v| (v.count_ones(), v));
            for v in candidates {
                take(v, &mut out);
            }
            return out;
        }
        let bits = bit_positions(support).collect_vec();
        for w in 1..=max_weight as usize {
            let candidates = bits
                .iter()
                .combinations(w)
                .map(|c| c.into_iter().fold(0usize, |x, &b| x | (1 << b)))
                .filter(|&v| self.satisfies(v))
                .sorted();
            for v in candidates {
                take(v, &mut out);
            }
            if out.len() == count {
                break;
            }
        }
        out
    }
}

/// All vectors `origin ^ (any combination of basis)`, enumerated in Gray-code order.
fn affine_span(origin: usize, basis: &[usize]) -> impl Iterator<Item = usize> + '_ {
    let n = basis.len();
    let mut x = origin;
    (0..1usize << n).map(move |i| {
        if i > 0 {
            x ^= basis[i.trailing_zeros() as usize];
        }
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_rank() {
        let mut sys = Gf2System::new();
        assert_eq!(sys.insert(0b011, true), Insertion::Independent { pivot: 1 });
        assert_eq!(sys.insert(0b110, false), Insertion::Independent { pivot: 2 });
        assert_eq!(sys.insert(0b101, true), Insertion::Redundant);
        assert_eq!(sys.insert(0b101, false), Insertion::Contradiction);
        assert_eq!(sys.rank(), 2);
        assert_eq!(sys.equations(), 4);
        assert_eq!(sys.contradictions(), 1);
        assert_eq!(sys.nullity(), 1);
        assert!(!sys.is_determined());
    }

    #[test]
    fn test_reduced_form_solution() {
        // x0 ^ x1 = 1, x1 ^ x2 = 0, x2 = 1  =>  x = 0b110
        let mut sys = Gf2System::new();
        sys.insert(0b011, true);
        sys.insert(0b110, false);
        sys.insert(0b100, true);
        assert!(sys.is_determined());
        assert_eq!(sys.particular_solution(), 0b110);
        assert!(sys.satisfies(0b110));
        assert_eq!(sys.min_weight_solution(8), Some(0b110));
    }

    #[test]
    fn test_null_space() {
        let mut sys = Gf2System::new();
        sys.insert(0b0011, false);
        sys.insert(0b1100, false);
        let basis = sys.null_space(0b1111);
        assert_eq!(basis.len(), 2);
        for v in &basis {
            assert!(sys.satisfies(*v));
        }
        // free bits outside the rows are part of the null space
        assert_eq!(sys.null_space(0b1_1111).len(), 3);
    }

    #[test]
    fn test_min_weight_prefers_sparse() {
        // x3 ^ x5 must be 1 and x3 ^ x4 must be 1; x4 free with x5 tied to it
        let mut sys = Gf2System::new();
        sys.insert(0b101000, true);
        sys.insert(0b011000, true);
        // solutions: {3} and {4, 5}
        assert_eq!(sys.min_weight_solution(8), Some(0b001000));
        assert_eq!(sys.min_weight_solution(0), None);
    }

    #[test]
    fn test_min_weight_is_order_independent() {
        let eqs = [(0b1001, true), (0b0110, false), (0b1111, true), (0b0011, true)];
        let mut a = Gf2System::new();
        let mut b = Gf2System::new();
        for &(c, r) in &eqs {
            a.insert(c, r);
        }
        for &(c, r) in eqs.iter().rev() {
            b.insert(c, r);
        }
        assert_eq!(a.min_weight_solution(8), b.min_weight_solution(8));
    }

    #[test]
    fn test_min_weight_basis() {
        // conflicts span the kernel of f1 = {0, 1} and f2 = {2, 3}
        let mut sys = Gf2System::new();
        for d in [0b0011, 0b1100, 0b0000_1111, 0b1_0000] {
            sys.insert(d, false);
        }
        let basis = sys.min_weight_basis(sys.exercised(), 4, 8);
        assert_eq!(basis, vec![0b0011, 0b1100]);
        // an unexercised bit is a function of its own
        let basis = sys.min_weight_basis(0b10_0000 | sys.exercised(), 4, 8);
        assert_eq!(basis, vec![0b10_0000, 0b0011, 0b1100]);
    }

    #[test]
    fn test_affine_span_enumerates_all() {
        let all: Vec<_> = affine_span(0b1, &[0b10, 0b100]).sorted().collect();
        assert_eq!(all, vec![0b001, 0b011, 0b101, 0b111]);
    }
}
