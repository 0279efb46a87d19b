use crate::util::parity;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// DRAM address with bank, row, and column components.
///
/// Represents the physical organization of a memory address in DRAM,
/// decoded from a physical address using discovered address functions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DRAMAddr {
    /// Bank number (one bit per address function, first function is the LSB)
    pub bank: usize,
    /// Row number
    pub row: usize,
    /// Column number
    pub col: usize,
}

impl Display for DRAMAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "({}, {}, {})", self.bank, self.row, self.col)
    }
}

impl DRAMAddr {
    /// Creates a new DRAM address.
    pub fn new(bank: usize, row: usize, col: usize) -> Self {
        DRAMAddr { bank, row, col }
    }

    /// Decodes a physical address into DRAM components.
    ///
    /// # Arguments
    ///
    /// * `addr` - Physical address
    /// * `functions` - Bank address functions as bit masks
    /// * `row` - Bit range holding the row index
    /// * `col` - Bit range holding the column index
    pub fn from_phys(addr: usize, functions: &[usize], row: BitRange, col: BitRange) -> DRAMAddr {
        let bank = functions
            .iter()
            .enumerate()
            .fold(0, |bank, (i, &f)| bank | (parity(addr & f) as usize) << i);
        DRAMAddr {
            bank,
            row: row.extract(addr),
            col: col.extract(addr),
        }
    }
}

/// An inclusive range of address bits, e.g. `17-32` for row bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BitRange {
    /// Lowest bit
    pub start: usize,
    /// Number of bits
    pub len: usize,
}

/// Errors parsing a [`BitRange`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitRangeError {
    /// Not of the form `a-b` or `a`
    #[error("invalid bit range '{0}', expected 'start-end'")]
    Syntax(String),
    /// End bit lies below start bit
    #[error("bit range end {end} lies below start {start}")]
    Reversed {
        /// Start bit
        start: usize,
        /// End bit
        end: usize,
    },
    /// Bit lies beyond the address width
    #[error("bit {0} exceeds the {max}-bit address width", max = usize::BITS)]
    OutOfRange(usize),
}

impl BitRange {
    /// Creates the range `start..=end`.
    pub fn new(start: usize, end: usize) -> Result<Self, BitRangeError> {
        if end < start {
            return Err(BitRangeError::Reversed { start, end });
        }
        if end >= usize::BITS as usize {
            return Err(BitRangeError::OutOfRange(end));
        }
        Ok(BitRange {
            start,
            len: end - start + 1,
        })
    }

    /// Mask with all bits of the range set.
    pub fn mask(&self) -> usize {
        crate::util::bit_window(self.start, self.start + self.len)
    }

    /// Extracts the bits of the range from `value`, shifted down to bit 0.
    pub fn extract(&self, value: usize) -> usize {
        (value & self.mask()) >> self.start
    }
}

impl FromStr for BitRange {
    type Err = BitRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || BitRangeError::Syntax(s.to_owned());
        let (start, end) = match s.trim().split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s.trim(), s.trim()),
        };
        let start = start.parse::<usize>().map_err(|_| syntax())?;
        let end = end.parse::<usize>().map_err(|_| syntax())?;
        BitRange::new(start, end)
    }
}

impl TryFrom<String> for BitRange {
    type Error = BitRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BitRange> for String {
    fn from(value: BitRange) -> Self {
        value.to_string()
    }
}

impl Display for BitRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            return write!(f, "none");
        }
        write!(f, "{}-{}", self.start, self.start + self.len - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bit_range() {
        let r: BitRange = "17-32".parse().expect("range");
        assert_eq!(r, BitRange { start: 17, len: 16 });
        assert_eq!(r.to_string(), "17-32");
        assert_eq!("6".parse::<BitRange>(), Ok(BitRange { start: 6, len: 1 }));
        assert_eq!(
            "9-3".parse::<BitRange>(),
            Err(BitRangeError::Reversed { start: 9, end: 3 })
        );
        assert!(matches!(
            "rows".parse::<BitRange>(),
            Err(BitRangeError::Syntax(_))
        ));
    }

    #[test]
    fn test_bit_range_beyond_address_width() {
        assert_eq!(
            "17-64".parse::<BitRange>(),
            Err(BitRangeError::OutOfRange(64))
        );
        assert_eq!(BitRange::new(70, 80), Err(BitRangeError::OutOfRange(80)));
        let top = BitRange::new(60, 63).expect("range");
        assert_eq!(top.extract(usize::MAX), 0xf);
        assert!(serde_json::from_str::<BitRange>("\"64\"").is_err());
    }

    #[test]
    fn test_extract() {
        let col = BitRange::new(0, 12).expect("range");
        let row = BitRange::new(18, 20).expect("range");
        let addr = (0b101 << 18) | 0x123;
        assert_eq!(row.extract(addr), 0b101);
        assert_eq!(col.extract(addr), 0x123);
    }

    #[test]
    fn test_from_phys() {
        let functions = [(1 << 13) | (1 << 17), 1 << 14];
        let row = BitRange::new(18, 29).expect("range");
        let col = BitRange::new(0, 12).expect("range");
        let d = DRAMAddr::from_phys((1 << 13) | (1 << 14) | (3 << 18) | 0x40, &functions, row, col);
        assert_eq!(d, DRAMAddr::new(0b11, 3, 0x40));
        let d = DRAMAddr::from_phys((1 << 13) | (1 << 17), &functions, row, col);
        assert_eq!(d.bank, 0);
    }

    #[test]
    fn test_bit_range_serde() {
        let r: BitRange = serde_json::from_str("\"0-12\"").expect("json");
        assert_eq!(r.len, 13);
        assert_eq!(serde_json::to_string(&r).expect("json"), "\"0-12\"");
    }
}
