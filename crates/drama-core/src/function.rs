//! Address functions and the value objects reported by a discovery run.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::gf2::Gf2System;
use crate::memory::{BitRange, DRAMAddr, PhysAddr};
use crate::util::{format_bits, parity};

/// XOR of two physical addresses.
///
/// Under XOR-linear address mapping the conflict label of a pair depends only
/// on this vector, so it is the unit of evidence for the solver.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DifferenceVector(usize);

impl DifferenceVector {
    /// Difference of the pair `(a, b)`. Symmetric in its arguments.
    pub fn of(a: PhysAddr, b: PhysAddr) -> Self {
        DifferenceVector(a.as_usize() ^ b.as_usize())
    }

    /// Wraps a raw bit vector.
    pub const fn from_bits(bits: usize) -> Self {
        DifferenceVector(bits)
    }

    /// The raw bit vector.
    pub const fn bits(&self) -> usize {
        self.0
    }
}

/// A boolean XOR function over physical address bits.
///
/// `parity(mask & addr)` yields one output bit of the memory controller's
/// mapping. Two addresses agree on the output bit iff
/// `parity(mask & (a ^ b)) == 0`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressFunction(usize);

impl AddressFunction {
    /// Creates a function from its bit mask.
    pub const fn new(mask: usize) -> Self {
        AddressFunction(mask)
    }

    /// The bit mask of participating address bits.
    pub const fn mask(&self) -> usize {
        self.0
    }

    /// Number of participating address bits.
    pub fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Output bit of the function for `addr`.
    pub fn apply(&self, addr: PhysAddr) -> bool {
        parity(self.0 & addr.as_usize())
    }

    /// Whether the two addresses of a pair with difference `d` differ in this output bit.
    pub fn separates(&self, d: DifferenceVector) -> bool {
        parity(self.0 & d.bits())
    }
}

impl Display for AddressFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x} {}", self.0, format_bits(self.0))
    }
}

/// Outcome of validating a discovered function.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    /// Fresh measurements agreed with the function within tolerance
    Confirmed,
    /// The function could not be confirmed; it is reported but must not be trusted
    Unconfirmed {
        /// Why confirmation failed
        reason: String,
    },
}

/// One recovered output bit of the mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredFunction {
    /// Dimension name, e.g. `bank2`
    pub dimension: String,
    /// The address function
    pub function: AddressFunction,
    /// Agreement rate with fresh measurements (0.0-1.0)
    pub confidence: f64,
    /// Validation outcome
    #[serde(flatten)]
    pub confirmation: Confirmation,
}

impl DiscoveredFunction {
    /// Whether this function passed validation.
    pub fn is_confirmed(&self) -> bool {
        self.confirmation == Confirmation::Confirmed
    }
}

/// Ordered collection of discovered functions.
///
/// Members are kept linearly independent: a function that is the XOR of
/// earlier members is rejected by [`FunctionSet::push`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunctionSet {
    functions: Vec<DiscoveredFunction>,
}

/// A function that is a linear combination of functions already in the set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("function {function} for {dimension} is the XOR of already known functions")]
pub struct RedundantFunction {
    /// Dimension the rejected function was discovered for
    pub dimension: String,
    /// The rejected function
    pub function: AddressFunction,
}

impl FunctionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `function` if it is linearly independent of the current members.
    ///
    /// # Errors
    ///
    /// Returns [`RedundantFunction`] if `function` lies in the span of the set.
    pub fn push(&mut self, function: DiscoveredFunction) -> Result<(), RedundantFunction> {
        if self.is_redundant(function.function) {
            return Err(RedundantFunction {
                dimension: function.dimension,
                function: function.function,
            });
        }
        self.functions.push(function);
        Ok(())
    }

    /// Whether `function` is zero or an XOR of members of the set.
    pub fn is_redundant(&self, function: AddressFunction) -> bool {
        let mut span = Gf2System::new();
        for f in &self.functions {
            span.insert(f.function.mask(), false);
        }
        function.mask() == 0 || span.in_row_space(function.mask())
    }

    /// The members in discovery order.
    pub fn functions(&self) -> &[DiscoveredFunction] {
        &self.functions
    }

    /// The bit masks of all members.
    pub fn masks(&self) -> Vec<usize> {
        self.functions.iter().map(|f| f.function.mask()).collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// True only if the set is non-empty and every member is confirmed.
    pub fn is_confirmed(&self) -> bool {
        !self.functions.is_empty() && self.functions.iter().all(|f| f.is_confirmed())
    }

    /// Whether two addresses map to the same bank according to all members.
    pub fn same_bank(&self, a: PhysAddr, b: PhysAddr) -> bool {
        let d = DifferenceVector::of(a, b);
        self.functions.iter().all(|f| !f.function.separates(d))
    }

    /// Decodes `addr` into DRAM coordinates using the members as bank bits.
    pub fn decode(&self, addr: PhysAddr, row: BitRange, col: BitRange) -> DRAMAddr {
        DRAMAddr::from_phys(addr.as_usize(), &self.masks(), row, col)
    }
}

impl Display for FunctionSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for func in &self.functions {
            let status = match &func.confirmation {
                Confirmation::Confirmed => "confirmed".to_string(),
                Confirmation::Unconfirmed { reason } => format!("unconfirmed: {}", reason),
            };
            writeln!(
                f,
                "{:<10} {:<40} {:.3} {}",
                func.dimension, func.function, func.confidence, status
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(dimension: &str, mask: usize) -> DiscoveredFunction {
        DiscoveredFunction {
            dimension: dimension.into(),
            function: AddressFunction::new(mask),
            confidence: 1.0,
            confirmation: Confirmation::Confirmed,
        }
    }

    #[test]
    fn test_difference_commutes() {
        let a = PhysAddr::new(0x1234_5678);
        let b = PhysAddr::new(0x0abc_def0);
        assert_eq!(DifferenceVector::of(a, b), DifferenceVector::of(b, a));
        assert_eq!(DifferenceVector::of(a, a).bits(), 0);
    }

    #[test]
    fn test_separates() {
        let f = AddressFunction::new(0b101000);
        assert!(f.separates(DifferenceVector::from_bits(0b001000)));
        assert!(!f.separates(DifferenceVector::from_bits(0b101000)));
        assert!(!f.separates(DifferenceVector::from_bits(0b010111)));
        assert_eq!(f.weight(), 2);
        assert_eq!(f.to_string(), "0x28 (3, 5)");
    }

    #[test]
    fn test_push_rejects_redundant() {
        let mut set = FunctionSet::new();
        set.push(confirmed("bank0", 0b0011)).expect("independent");
        set.push(confirmed("bank1", 0b0110)).expect("independent");
        let err = set.push(confirmed("bank2", 0b0101)).unwrap_err();
        assert_eq!(err.function, AddressFunction::new(0b0101));
        assert!(set.push(confirmed("bank2", 0)).is_err());
        set.push(confirmed("bank2", 0b1000)).expect("independent");
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_confirmation_gates_set() {
        let mut set = FunctionSet::new();
        assert!(!set.is_confirmed());
        set.push(confirmed("bank0", 1 << 13)).expect("independent");
        assert!(set.is_confirmed());
        set.push(DiscoveredFunction {
            confirmation: Confirmation::Unconfirmed {
                reason: "disagreement 0.31".into(),
            },
            ..confirmed("bank1", 1 << 14)
        })
        .expect("independent");
        assert!(!set.is_confirmed());
    }

    #[test]
    fn test_same_bank() {
        let mut set = FunctionSet::new();
        set.push(confirmed("bank0", (1 << 13) | (1 << 17))).expect("independent");
        let a = PhysAddr::new(0x4000_0000);
        assert!(set.same_bank(a, a ^ ((1 << 13) | (1 << 17))));
        assert!(!set.same_bank(a, a ^ (1 << 17)));
    }

    #[test]
    fn test_serialize_tagged() {
        let value = serde_json::to_value(confirmed("rank", 1 << 16)).expect("json");
        assert_eq!(value["status"], "confirmed");
        assert_eq!(value["function"], 1 << 16);
    }
}
