//! Bit helpers shared by the solver, sampler and validator.

/// Parity (XOR of all bits) of `x`.
#[inline]
pub fn parity(x: usize) -> bool {
    x.count_ones() & 1 == 1
}

/// Iterates over the positions of all set bits of `mask`, lowest first.
pub fn bit_positions(mask: usize) -> impl Iterator<Item = usize> {
    (0..usize::BITS as usize).filter(move |b| mask & (1 << b) != 0)
}

/// Mask with bits `low..high` set.
pub fn bit_window(low: usize, high: usize) -> usize {
    if high <= low || low >= usize::BITS as usize {
        return 0;
    }
    let upper = if high >= usize::BITS as usize {
        usize::MAX
    } else {
        (1 << high) - 1
    };
    upper & !((1 << low) - 1)
}

/// Formats a mask as the list of its bit positions, e.g. `(6, 13)`.
pub fn format_bits(mask: usize) -> String {
    let bits = bit_positions(mask)
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("({})", bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity() {
        assert!(!parity(0));
        assert!(parity(0b1000));
        assert!(!parity(0b101000));
        assert!(parity(0b111));
    }

    #[test]
    fn test_bit_window() {
        assert_eq!(bit_window(6, 8), 0b1100_0000);
        assert_eq!(bit_window(0, 64), usize::MAX);
        assert_eq!(bit_window(5, 5), 0);
        assert_eq!(bit_window(64, 70), 0);
        assert_eq!(bit_window(63, 70), 1 << 63);
    }

    #[test]
    fn test_format_bits() {
        assert_eq!(format_bits(0b101000), "(3, 5)");
        assert_eq!(bit_positions(0).count(), 0);
    }
}
