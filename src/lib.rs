//! kiln: deterministic replay of batch-scheduler traces.
//!
//! The workspace crates, re-exported under one roof:
//!
//! - [`time`]: injectable wall and simulated clocks
//! - [`cache`]: expiration-aware memoizing cache
//! - [`sim`]: the replay harness, trace files and equivalence checks
//! - [`testing`]: in-memory store, mock cluster and reference scheduler

pub use kiln_cache as cache;
pub use kiln_sim as sim;
pub use kiln_testing as testing;
pub use kiln_time as time;
