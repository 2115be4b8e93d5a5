//! Error types for the replay harness.

use std::path::PathBuf;

use snafu::Snafu;

use crate::phase::Phase;

/// Result type for harness operations.
pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Errors that abort a simulation run.
///
/// Every variant is fatal to the run that raised it; the harness never retries a
/// cycle. The incremental writer logs its own failures instead of returning them.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SimError {
    /// A required configuration option is absent.
    #[snafu(display("missing required configuration option: {option}"))]
    MissingConfig {
        /// Name of the option.
        option: String,
    },

    /// A configuration option has an unusable value.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[snafu(display("failed to read configuration from {}: {source}", path.display()))]
    ReadConfig {
        /// File that was read.
        path: PathBuf,
        /// Source error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::SimConfig`].
    #[snafu(display("failed to parse configuration: {source}"))]
    ParseConfig {
        /// Source error.
        source: toml::de::Error,
    },

    /// A submission batch is not sorted by submit time.
    #[snafu(display("submission batch is not sorted by submit time; offending timestamps: {offending:?}"))]
    OrderingViolation {
        /// Up to [`crate::constants::MAX_ORDERING_VIOLATIONS_REPORTED`] offending timestamps.
        offending: Vec<u64>,
    },

    /// A convergence poll did not succeed in time.
    #[snafu(display("timed out after {timeout_ms}ms waiting for {label}{}", diagnostics.as_deref().map(|d| format!(": {d}")).unwrap_or_default()))]
    PollTimeout {
        /// What was being waited for.
        label: String,
        /// Time allowed.
        timeout_ms: u64,
        /// Snapshot of the observed state when the poll gave up.
        diagnostics: Option<String>,
    },

    /// The scheduler under test stopped listening on a phase channel or dropped an
    /// acknowledgement without fulfilling it.
    #[snafu(display("phase channel closed: {phase}"))]
    PhaseChannelClosed {
        /// Phase that could not be signalled.
        phase: Phase,
    },

    /// A collaborator store call failed.
    #[snafu(display("store operation failed: {source}"))]
    Store {
        /// Source error.
        source: StoreError,
    },

    /// A trace file could not be opened or written.
    #[snafu(display("trace file {}: {source}", path.display()))]
    TraceIo {
        /// Trace file.
        path: PathBuf,
        /// Source error.
        source: std::io::Error,
    },

    /// A trace row could not be encoded or decoded.
    #[snafu(display("trace file {}: {source}", path.display()))]
    TraceCsv {
        /// Trace file.
        path: PathBuf,
        /// Source error.
        source: csv::Error,
    },
}

/// Errors reported by a [`crate::JobStore`] or [`crate::ClusterView`] implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// A record with this id already exists.
    #[snafu(display("duplicate {kind}: {id}"))]
    Duplicate {
        /// Record kind.
        kind: String,
        /// Record id.
        id: String,
    },

    /// A referenced record does not exist.
    #[snafu(display("{kind} not found: {id}"))]
    NotFound {
        /// Record kind.
        kind: String,
        /// Record id.
        id: String,
    },

    /// The backend is unavailable.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Reason given by the backend.
        reason: String,
    },
}

impl From<StoreError> for SimError {
    fn from(source: StoreError) -> Self {
        SimError::Store { source }
    }
}
