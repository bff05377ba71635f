//! Custom error types for the delay generator controller.
//!
//! `DgError` is the single error type returned by the library. The first five
//! variants are the command-exchange failures a caller has to reason about:
//!
//! - **`NotConnected`**: the transport does not report itself open. Returned
//!   before the send lock or the reply queue is touched.
//! - **`TransportWriteTimeout`**: the command bytes could not be written within
//!   the write bound.
//! - **`ReplyTimeout`**: the command was written but no complete reply line
//!   arrived within the wait bound.
//! - **`SpuriousWake`**: the reply signal fired but the queue was empty.
//! - **`MalformedReply`**: a query answered with `?` or with text that does not
//!   parse as the expected value.
//!
//! None of them is fatal. The device model swallows them per attribute or per
//! directive and keeps going; the counters in
//! [`ConnectionState`](crate::device::ConnectionState) record how often the
//! link misbehaved.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the library error type.
pub type DgResult<T> = std::result::Result<T, DgError>;

/// Errors raised by the bridge, the device model and request dispatch.
#[derive(Error, Debug)]
pub enum DgError {
    /// No transport is open.
    #[error("Serial port not connected")]
    NotConnected,

    /// A command write exceeded the write bound.
    #[error("Timed out writing command '{0}' to the transport")]
    TransportWriteTimeout(String),

    /// No reply line arrived within the reply bound.
    #[error("No reply to '{0}' within the wait bound")]
    ReplyTimeout(String),

    /// The reply signal fired with nothing queued.
    #[error("Reply signal fired for '{0}' but the reply queue was empty")]
    SpuriousWake(String),

    /// The device answered with something the parser could not use.
    #[error("Malformed reply to '{command}': '{reply}'")]
    MalformedReply { command: String, reply: String },

    /// Any other transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A JSON document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A control request that matches no known form.
    #[error("Unknown request: {0}")]
    UnknownRequest(String),
}

impl DgError {
    /// True for the failures that mean the exchange itself went wrong, as
    /// opposed to the device answering with something unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            DgError::NotConnected
                | DgError::TransportWriteTimeout(_)
                | DgError::ReplyTimeout(_)
                | DgError::SpuriousWake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DgError::ReplyTimeout(":PULSE1:WIDTH?".into());
        assert_eq!(
            err.to_string(),
            "No reply to ':PULSE1:WIDTH?' within the wait bound"
        );

        let err = DgError::MalformedReply {
            command: ":PULSE2:DELAY?".into(),
            reply: "?".into(),
        };
        assert!(err.to_string().contains("'?'"));
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(DgError::NotConnected.is_link_failure());
        assert!(DgError::SpuriousWake("x".into()).is_link_failure());
        assert!(!DgError::MalformedReply {
            command: "x".into(),
            reply: "y".into()
        }
        .is_link_failure());
        assert!(!DgError::Transport("busy".into()).is_link_failure());
    }
}
