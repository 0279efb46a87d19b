//! # Drama
//!
//! Drama recovers the XOR functions a memory controller uses to map physical
//! addresses to DRAM banks and ranks. Pairs of addresses are timed; pairs
//! that hit the same bank in different rows suffer a row-buffer conflict and
//! are slower. The labeled pairs are solved as linear equations over GF(2).
//!
//! ## Quickstart guide
//!
//! Reserve hugepages and build the binary on a Linux x86-64 system:
//!
//! ```sh
//! echo 1 | sudo tee /sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages
//! cargo build --release
//! sudo target/release/drama --config crates/drama-core/config/drama.json --output report.json
//! ```
//!
//! The report lists every recovered function with its validation status,
//! the calibrated conflict threshold and the groups that failed.
//!
//! ## Modules
//!
//! Everything is re-exported from `drama-core`:
//!
//! - `memory`: The physical memory pool and address translation.
//! - `oracle`: Timing measurement and threshold calibration.
//! - `sampler`: Drawing and labeling address pairs.
//! - `solver`: GF(2) solving of the labeled pairs.
//! - `validator`: Confirming and minimizing recovered functions.
//! - `config`: JSON run configuration.
//!
//! ## Features
//!
//! - `hugepage`: Re-exports the hugetlbfs allocator as `drama::hugepage`.

pub use drama_core::*;

#[cfg(feature = "hugepage")]
pub use drama_hugepage as hugepage;
