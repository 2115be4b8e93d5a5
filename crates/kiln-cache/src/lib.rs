//! Expiration-aware memoizing cache for kiln.
//!
//! [`ExpiringCache`] memoizes expensive derived values behind one concurrent
//! key/value store and offers two lookup disciplines over it:
//!
//! 1. **Validated value** ([`ExpiringCache::get_or_compute`]): a stored value is served only
//!    while a caller-supplied validator accepts it. Freshly computed values are stored only
//!    if the same validator accepts them, and a `None` computation is never stored.
//!
//! 2. **Expiry envelope** ([`ExpiringCache::get_or_compute_with_expiry`]): values carry an
//!    optional expiry instant ([`Envelope`]). An envelope whose expiry is strictly before the
//!    clock's current instant is recomputed; an envelope without an expiry never expires.
//!
//! Neither discipline is single-flight. Concurrent lookups of the same key may each run
//! `compute`; the last writer wins.
//!
//! # Usage
//!
//! ```
//! use kiln_cache::{CacheConfig, ExpiringCache};
//!
//! let cache: ExpiringCache<u64, u64> = ExpiringCache::new(CacheConfig::default()).unwrap();
//! let even = |v: &u64| v % 2 == 0;
//!
//! assert_eq!(cache.get_or_compute(even, |k| Some(*k), 2), Some(2));
//! // Served from the store; compute is not called again.
//! assert_eq!(cache.get_or_compute(even, |_| unreachable!(), 2), Some(2));
//! ```
//!
//! # Tiger Style
//!
//! - Bounded size: `max_entries` is enforced on every insert
//! - Store decisions are pure functions in [`verified`]
//! - No locks are held while `compute` runs

mod cache;
mod envelope;
mod error;
pub mod verified;

pub use cache::CacheConfig;
pub use cache::CacheStats;
pub use cache::DEFAULT_MAX_CACHE_ENTRIES;
pub use cache::ExpiringCache;
pub use envelope::Envelope;
pub use envelope::Expires;
pub use error::CacheError;
pub use error::Result;
