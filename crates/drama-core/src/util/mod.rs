//! Utility functions and types used throughout the discovery engine.
//!
//! This module provides various helper types and traits including:
//! - [`Size`] - Memory size representation
//! - Constants for memory operations ([`PAGE_SIZE`], [`CL_SHIFT`], etc.)
//! - Bit helpers ([`parity`], [`bit_window`], [`format_bits`])
//! - Progress reporting utilities ([`NamedProgress`])
//! - Cancelable worker threads ([`spawn_cancelable`])
//! - Random number generation ([`Rng`])

mod alloc_util;
mod bits;
mod cancelable_thread;
mod constants;
mod named_progress;
mod rng;
mod size;

pub use self::alloc_util::*;
pub use self::bits::*;
pub use self::cancelable_thread::*;
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
pub use self::size::Size;
