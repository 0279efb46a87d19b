//! Hugepage-based memory allocator for DRAM address function discovery.
//!
//! This crate provides an allocator that uses Linux hugepages (1 GiB or
//! 2 MiB pages) to obtain physically contiguous memory for the physical
//! memory pool. Hugepages must be reserved before the run.
//!
//! Implements the [`drama_core::allocator::ConsecAllocator`] trait.
//!
//! # Platform Requirements
//!
//! - Linux with hugepage support
//! - Hugepages must be pre-allocated via kernel boot parameters or runtime configuration
//! - Mounted hugetlbfs at `/dev/hugepages`

#![warn(missing_docs)]

mod hugepage;

pub use hugepage::*;
