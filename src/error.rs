//! Error types
//!
//! - [`CallError`]: misuse of the call value objects (mutation after freeze,
//!   malformed paths)
//! - [`ObserverError`]: what an observer hook can return to the chain,
//!   including the distinguished terminate short-circuit
//! - [`StoreError`]: key-value adapter failures that are not plain I/O

use thiserror::Error;

/// Errors raised by [`Request`](crate::Request) / [`Response`](crate::Response) mutators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("request for '{method}' is frozen and cannot be mutated")]
    RequestFrozen { method: String },

    #[error("response is frozen and cannot be mutated")]
    ResponseFrozen,

    #[error("invalid value path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Errors surfaced by observer hooks.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// A terminating call could not (or need not) refresh `key`.
    ///
    /// This is control flow, not a service failure: the chain stops
    /// immediately and hands it to the caller unchanged.
    #[error("terminating call short-circuited for cache key '{key}'")]
    TerminateShortCircuit { key: String },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("cache store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl ObserverError {
    /// `true` for [`ObserverError::TerminateShortCircuit`]
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Self::TerminateShortCircuit { .. })
    }
}

/// Store adapter failures that carry more meaning than a connection error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("increment or decrement of '{key}' would overflow")]
    Overflow { key: String },

    #[error("lock TTL must be at least one second, got {millis}ms")]
    InvalidTtl { millis: u128 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_circuit_is_distinguished() {
        let short = ObserverError::TerminateShortCircuit { key: "foo:{}".into() };
        assert!(short.is_short_circuit());

        let store = ObserverError::from(anyhow::anyhow!("connection refused"));
        assert!(!store.is_short_circuit());
        assert!(store.to_string().contains("connection refused"));
    }

    #[test]
    fn test_call_error_converts() {
        let err: ObserverError = CallError::ResponseFrozen.into();
        assert!(matches!(err, ObserverError::Call(CallError::ResponseFrozen)));
    }
}
