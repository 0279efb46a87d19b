//! Cycle-accurate timing of DRAM accesses to address pairs.

use thiserror::Error;

/// Errors constructing a [`MemoryTupleTimer`].
#[derive(Debug, Error)]
pub enum TimerError {
    /// The CPU lacks the instructions needed for flushing and cycle counting
    #[error("no cycle-accurate timer available on this platform")]
    Unsupported,
}

/// Measures the latency of accessing two addresses back to back from DRAM.
///
/// The latency is elevated when both addresses map to the same bank but
/// different rows (row-buffer conflict).
pub trait MemoryTupleTimer: Send + Sync {
    /// Accesses `a` and `b` alternately for `rounds` rounds, flushing both
    /// cache lines before each round, and returns the median round latency in
    /// cycles.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for reads for the duration of the call.
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64;
}

/// Median of `samples`; reorders the slice. Returns 0 for an empty slice.
pub fn median(samples: &mut [u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mid = samples.len() / 2;
    let (_, m, _) = samples.select_nth_unstable(mid);
    *m
}

/// `rdtscp`-based timer with `clflush` eviction.
#[cfg(target_arch = "x86_64")]
struct RdtscpTimer;

#[cfg(target_arch = "x86_64")]
impl MemoryTupleTimer for RdtscpTimer {
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64 {
        use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence};

        let mut samples = Vec::with_capacity(rounds);
        let mut aux = 0;
        for _ in 0..rounds {
            unsafe {
                _mm_clflush(a);
                _mm_clflush(b);
                _mm_mfence();
                let start = __rdtscp(&mut aux);
                _mm_lfence();
                std::ptr::read_volatile(a);
                std::ptr::read_volatile(b);
                let end = __rdtscp(&mut aux);
                _mm_mfence();
                samples.push(end.saturating_sub(start));
            }
        }
        median(&mut samples)
    }
}

/// Constructs the platform timer.
///
/// # Errors
///
/// Returns [`TimerError::Unsupported`] if the platform has no usable cycle counter.
pub fn construct_memory_tuple_timer() -> Result<Box<dyn MemoryTupleTimer>, TimerError> {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("sse2") {
            return Ok(Box::new(RdtscpTimer));
        }
    }
    Err(TimerError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_ignores_outliers() {
        let mut samples = vec![210, 205, 9_000, 207, 202];
        assert_eq!(median(&mut samples), 207);
        assert_eq!(median(&mut []), 0);
    }

    #[test]
    #[ignore = "timing test depends on hardware and system noise"]
    fn test_rdtscp_timer() {
        let timer = construct_memory_tuple_timer().expect("timer");
        let buf = vec![0u8; 1 << 20];
        let t = unsafe { timer.time_subsequent_access_from_ram(&buf[0], &buf[1 << 19], 100) };
        assert!(t > 0);
    }
}
