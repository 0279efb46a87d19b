//! # Drama Core
//!
//! `drama-core` recovers the XOR address functions a DRAM memory controller
//! uses to map physical addresses to banks, ranks and channels. It observes
//! row-buffer conflicts through access timing and solves for the functions
//! over GF(2).
//!
//! ## Architecture Overview
//!
//! A run is built from two abstractions that have a hardware-backed and a
//! synthetic implementation each:
//!
//! - [`memory::AddressPool`] - The addresses pairs are drawn from.
//!   [`memory::PhysPool`] is large-page backed memory with resolved physical
//!   addresses, acquired through an [`allocator::ConsecAllocator`].
//!   [`memory::SyntheticPool`] models an address space without memory.
//!
//! - [`oracle::TimingOracle`] - Labels a pair as row conflict or not.
//!   [`oracle::HardwareOracle`] times real accesses, while
//!   [`oracle::SyntheticOracle`] answers from injected functions.
//!
//! ## Main Components
//!
//! - [`oracle::calibrate`] - Picks the latency threshold separating conflicts.
//! - [`sampler::Sampler`] - Draws and labels pairs, subject to an [`sampler::Isolation`].
//! - [`solver::Solver`] - Incremental GF(2) elimination with a minimum weight tie-break.
//! - [`validator::Validator`] - Confirms and minimizes functions with fresh pairs.
//! - [`Drama`] - The orchestrator combining all of the above into a [`DiscoveryReport`].
//!
//! ## Platform Support
//!
//! Hardware runs require x86_64 Linux with access to `/proc/self/pagemap`
//! and hugetlbfs, which usually means root privileges. Everything else runs
//! anywhere against the synthetic pool and oracle.

#![warn(missing_docs)]

pub mod allocator;
pub mod config;
mod discovery;
pub mod function;
pub mod gf2;
pub mod memory;
pub mod oracle;
pub mod sampler;
pub mod solver;
pub mod util;
pub mod validator;

pub use discovery::{DimensionFailure, DiscoveryReport, Drama, DramaBuilder, Error, acquire_pool};
