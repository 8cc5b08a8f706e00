use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KioskErrorCategory {
    /// Rejected locally before any network call (limits, settings, file type).
    Validation,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the server.
    RateLimited,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Invariant break or unsupported state.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct KioskError {
    /// High-level error category.
    pub category: KioskErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl KioskError {
    pub fn new(
        category: KioskErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Local validation failure; never reaches the network.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(KioskErrorCategory::Validation, code, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl std::fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            KioskErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }

    pub fn slide_not_found(id: &str) -> Self {
        Self::new(
            KioskErrorCategory::Validation,
            "slide_not_found",
            format!("slide '{id}' is not in the collection"),
        )
    }

    /// Whether the user can reasonably retry the same gesture.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            KioskErrorCategory::Network | KioskErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> KioskErrorCategory {
    match status {
        401 | 403 => KioskErrorCategory::Auth,
        408 | 429 => KioskErrorCategory::RateLimited,
        400..=499 => KioskErrorCategory::Validation,
        500..=599 => KioskErrorCategory::Network,
        _ => KioskErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), KioskErrorCategory::Auth);
        assert_eq!(classify_http_status(429), KioskErrorCategory::RateLimited);
        assert_eq!(classify_http_status(422), KioskErrorCategory::Validation);
        assert_eq!(classify_http_status(503), KioskErrorCategory::Network);
        assert_eq!(classify_http_status(700), KioskErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = KioskError::invalid_state("Idle", "drop");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, KioskErrorCategory::Internal);
        assert!(err.message.contains("drop"));
    }

    #[test]
    fn only_network_and_rate_limit_are_transient() {
        assert!(KioskError::new(KioskErrorCategory::Network, "n", "down").is_transient());
        assert!(KioskError::new(KioskErrorCategory::RateLimited, "r", "slow").is_transient());
        assert!(!KioskError::validation("slide_limit_reached", "full").is_transient());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = KioskError::new(KioskErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
