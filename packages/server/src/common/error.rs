//! Error taxonomy for the room runtime.
//!
//! The engine and reducer are I/O-free and can only raise logical errors;
//! the room actor is the sole boundary that talks to the store and the sole
//! producer of client-visible errors. Everything a caller can see is one of
//! these kinds.

use thiserror::Error;

/// Errors surfaced by the room runtime to sessions and REST callers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed request: bad payload, unknown command type, schema
    /// violation. Never written to the event log.
    #[error("validation: {0}")]
    Validation(String),

    /// Caller is not allowed: not a member, privilege required.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Infrastructure failed transiently (DB contention, socket write,
    /// queue unavailable). The command was not applied.
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    /// An invariant the system relies on was violated (seq collision,
    /// snapshot corruption, reducer panic outside command scope). The room
    /// actor crashes and the manager rebuilds it from the durable log.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    /// The room actor is gone (shutting down or mid-rebuild); retry.
    #[error("room unavailable: {0}")]
    Unavailable(String),
}

impl CoreError {
    /// Wire error code for the WebSocket `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "bad_request",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Transient(_) | CoreError::Fatal(_) | CoreError::Unavailable(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(CoreError::Validation("x".into()).code(), "bad_request");
        assert_eq!(CoreError::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(
            CoreError::Transient(anyhow::anyhow!("db down")).code(),
            "internal"
        );
    }
}
