//! Error types for cache construction.

use snafu::Snafu;

/// Result type for cache operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors raised by the cache itself.
///
/// Failures inside a caller's `compute` are not wrapped here; they propagate to the
/// caller in the caller's own error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    /// The cache configuration is unusable.
    #[snafu(display("invalid cache configuration: {reason}"))]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },
}
