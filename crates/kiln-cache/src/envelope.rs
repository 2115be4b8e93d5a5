//! Expiry envelopes for the TTL lookup discipline.

use serde::Deserialize;
use serde::Serialize;

/// A cached value that may carry an expiry instant.
pub trait Expires {
    /// Instant (ms) after which the value is stale, or `None` if it never expires.
    fn expires_at_ms(&self) -> Option<u64>;
}

/// Payload annotated with an optional expiry instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Cached payload.
    pub payload: T,
    /// Expiry instant in milliseconds; absent means never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl<T> Envelope<T> {
    /// Envelope that expires at `expires_at_ms`.
    pub fn expiring(payload: T, expires_at_ms: u64) -> Self {
        Self {
            payload,
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// Envelope that never expires.
    pub fn permanent(payload: T) -> Self {
        Self {
            payload,
            expires_at_ms: None,
        }
    }

    /// Envelope expiring `ttl_ms` after `now_ms`.
    pub fn with_ttl(payload: T, now_ms: u64, ttl_ms: u64) -> Self {
        Self::expiring(payload, now_ms.saturating_add(ttl_ms))
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T> Expires for Envelope<T> {
    fn expires_at_ms(&self) -> Option<u64> {
        self.expires_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_ttl_adds_to_now() {
        let envelope = Envelope::with_ttl("v", 1_000, 500);
        assert_eq!(envelope.expires_at_ms(), Some(1_500));
    }

    #[test]
    fn permanent_has_no_expiry() {
        assert_eq!(Envelope::permanent(1).expires_at_ms(), None);
    }

    #[test]
    fn missing_expiry_field_deserializes_as_permanent() {
        let envelope: Envelope<u32> = serde_json::from_str("{\"payload\":7}").unwrap();
        assert_eq!(envelope, Envelope::permanent(7));
    }

    #[test]
    fn permanent_envelope_omits_expiry_field() {
        let json = serde_json::to_string(&Envelope::permanent(7)).unwrap();
        assert_eq!(json, "{\"payload\":7}");
    }
}
