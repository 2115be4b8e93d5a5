//! Fixed limits and well-known names for the replay harness.
//!
//! Tiger Style: every loop the harness runs is bounded by one of these.

/// Label carrying a job's intended run duration in milliseconds.
pub const SIM_RUN_TIME_LABEL: &str = "kiln.sim/run-time-ms";

/// Label carrying a job's intended terminal status (`success` or `failed`).
pub const SIM_STATUS_LABEL: &str = "kiln.sim/status";

/// Maximum offending timestamps carried by an ordering violation.
pub const MAX_ORDERING_VIOLATIONS_REPORTED: usize = 100;

/// Logical milliseconds the clock is bumped between submissions and phases.
pub const CLOCK_BUMP_MS: u64 = 1;

/// Default spacing between convergence poll attempts.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default time allowed for a convergence poll.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;

/// Default wall-clock interval between incremental trace writes.
pub const DEFAULT_INCREMENTAL_OUTPUT_INTERVAL_MS: u64 = 60_000;

/// Default logical interval between optimizer invocations.
pub const DEFAULT_OPTIMIZER_INTERVAL_MS: u64 = 60_000;

/// Default logical interval between rebalancer invocations.
pub const DEFAULT_REBALANCE_INTERVAL_MS: u64 = 60_000;

/// Default probability of requesting memory reclamation after a cycle.
pub const DEFAULT_RECLAIM_PROBABILITY: f64 = 0.1;

/// Capacity of each phase signal channel. Phases are strictly sequential, so one
/// outstanding acknowledgement per phase is the most the harness ever posts.
pub const PHASE_CHANNEL_CAPACITY: usize = 1;

/// Maximum ids listed per side in a set-difference diagnostic.
pub const MAX_DIAGNOSTIC_IDS: usize = 50;
