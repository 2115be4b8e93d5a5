//! Pure decision functions for the cache.
//!
//! The async-free shell in [`crate::ExpiringCache`] reads the store and the clock,
//! then defers every keep/store/expire decision to these functions. Time is always
//! an explicit parameter.
//!
//! # Tiger Style
//!
//! - Pure functions with no side effects
//! - Saturating arithmetic for overflow safety

/// What to do with a value obtained from the store or from `compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDecision {
    /// Nothing to return and nothing to store.
    Absent,
    /// Return the value and keep it in the store.
    ReturnAndStore,
    /// Return the value but never persist it.
    ReturnOnly,
}

/// Decide the fate of a candidate value under the validated-value discipline.
///
/// Applied identically to a value read back from the store and to a freshly computed
/// one: a value is stored (or kept) only if the validator accepts it.
///
/// # Example
///
/// ```
/// use kiln_cache::verified::{decide_store, StoreDecision};
///
/// assert_eq!(decide_store(false, false), StoreDecision::Absent);
/// assert_eq!(decide_store(true, true), StoreDecision::ReturnAndStore);
/// assert_eq!(decide_store(true, false), StoreDecision::ReturnOnly);
/// ```
#[inline]
pub fn decide_store(present: bool, accepted: bool) -> StoreDecision {
    match (present, accepted) {
        (false, _) => StoreDecision::Absent,
        (true, true) => StoreDecision::ReturnAndStore,
        (true, false) => StoreDecision::ReturnOnly,
    }
}

/// An envelope is expired only when its expiry instant is strictly before `now_ms`.
///
/// An envelope without an expiry never expires.
#[inline]
pub fn is_envelope_expired(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    match expires_at_ms {
        Some(expires_at) => expires_at < now_ms,
        None => false,
    }
}

/// Whether an entry inserted at `inserted_at_ms` has outlived `max_age_ms`.
#[inline]
pub fn is_entry_stale(inserted_at_ms: u64, max_age_ms: Option<u64>, now_ms: u64) -> bool {
    match max_age_ms {
        Some(max_age) => now_ms.saturating_sub(inserted_at_ms) > max_age,
        None => false,
    }
}

/// Number of entries to evict so that `len` fits within `max_entries`.
#[inline]
pub fn eviction_count(len: usize, max_entries: usize) -> usize {
    len.saturating_sub(max_entries)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // ========================================================================
    // decide_store tests
    // ========================================================================

    #[test]
    fn test_absent_ignores_validator() {
        assert_eq!(decide_store(false, true), StoreDecision::Absent);
        assert_eq!(decide_store(false, false), StoreDecision::Absent);
    }

    #[test]
    fn test_rejected_value_is_returned_not_stored() {
        assert_eq!(decide_store(true, false), StoreDecision::ReturnOnly);
    }

    // ========================================================================
    // is_envelope_expired tests
    // ========================================================================

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        assert!(!is_envelope_expired(Some(1_000), 999));
        assert!(!is_envelope_expired(Some(1_000), 1_000));
        assert!(is_envelope_expired(Some(1_000), 1_001));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        assert!(!is_envelope_expired(None, 0));
        assert!(!is_envelope_expired(None, u64::MAX));
    }

    // ========================================================================
    // is_entry_stale tests
    // ========================================================================

    #[test]
    fn test_stale_after_max_age() {
        assert!(!is_entry_stale(100, Some(50), 150));
        assert!(is_entry_stale(100, Some(50), 151));
    }

    #[test]
    fn test_clock_behind_insert_is_fresh() {
        assert!(!is_entry_stale(200, Some(0), 100));
    }

    #[test]
    fn test_unbounded_age() {
        assert!(!is_entry_stale(0, None, u64::MAX));
    }

    // ========================================================================
    // eviction_count tests
    // ========================================================================

    #[test]
    fn test_eviction_count() {
        assert_eq!(eviction_count(10, 8), 2);
        assert_eq!(eviction_count(3, 8), 0);
    }

    proptest! {
        #[test]
        fn expiry_returns_unchanged_until_boundary(expires in 0u64..1_000_000, now in 0u64..1_000_000) {
            prop_assert_eq!(is_envelope_expired(Some(expires), now), now > expires);
        }
    }
}
