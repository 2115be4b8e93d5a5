//! Pure functions for harness cycle logic.
//!
//! The async [`crate::Simulator`] shell reads the clock and the store, then asks these
//! functions what to do. Everything here is deterministic and takes time as an explicit
//! parameter, so the cycle rules can be tested without a runtime.
//!
//! # Tiger Style
//!
//! - Pure functions with no side effects
//! - Time passed as explicit parameter
//! - Saturating arithmetic for overflow safety

mod convergence;
mod cycle;

pub use convergence::*;
pub use cycle::*;
