// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for RtmpKit.
//!
//! Errors are grouped into a taxonomy so the connection state machine can
//! pattern-match on kind rather than string-sniffing messages. The `Control`
//! variants are not failures: they are used to carry flow-control signals
//! (redirect, republish, graceful close) up through `?` to the one place
//! that knows how to react to them, per the "exceptions-for-flow" pattern
//! this system is built around.

use thiserror::Error;

/// Convenience alias for results using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RtmpKit operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Chunk framing, AMF0 decode, or packet size violations.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake (simple or complex) failed.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Non-fatal control-flow signal consumed by the connection FSM's service loop.
    #[error("control: {0}")]
    Control(#[from] ControlError),

    /// Access denied by security rules, referer check, or edge token traverse.
    #[error("auth error: {0}")]
    Auth(String),

    /// Stream-level condition: publish collision, empty name, duration exceeded.
    #[error("stream error: {0}")]
    Stream(String),

    /// Socket read/write/timeout/EOF.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bounded-growth resource exceeded its cap.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// HTTP request/response framing error.
    #[error("http error: {0}")]
    Http(String),

    /// HMAC/DH/SHA256 primitive failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Vhost/config lookup failure, or an invalid client type.
    #[error("config error: {0}")]
    Config(String),
}

/// Non-fatal control-flow signals raised from deep inside the protocol
/// layers and handled explicitly by the connection service loop.
///
/// These are distinguished from [`Error::Stream`]/[`Error::Auth`] so call
/// sites can tell "the connection should keep running, just differently"
/// from "the connection is over".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// `onStatus NetConnection.Connect.Rejected` with a redirect target was sent;
    /// the service loop should tear down this connection (the client is expected
    /// to reconnect elsewhere).
    #[error("redirect issued")]
    Redirect,

    /// An FMLE unpublish command arrived mid-publish; the service loop should
    /// loop back to re-identify the next command rather than closing.
    #[error("republish requested")]
    Republish,

    /// A `closeStream` command arrived; the service loop should return to
    /// `ServiceLoop` rather than terminating the connection.
    #[error("close requested")]
    RtmpClose,
}

impl Error {
    /// True for the `Control::Republish` signal specifically, which the
    /// connection FSM handles by looping back to `ServiceLoop` instead of
    /// tearing the connection down.
    #[must_use]
    pub const fn is_republish(&self) -> bool {
        matches!(self, Self::Control(ControlError::Republish))
    }

    /// True for `Control::RtmpClose`.
    #[must_use]
    pub const fn is_rtmp_close(&self) -> bool {
        matches!(self, Self::Control(ControlError::RtmpClose))
    }

    /// True for `Control::Redirect`.
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Control(ControlError::Redirect))
    }

    /// Whether this error should be logged at `warn` (redirect, graceful
    /// close) rather than `error` (everything else fatal).
    #[must_use]
    pub fn is_warn_level(&self) -> bool {
        match self {
            Self::Control(_) => true,
            Self::Io(e) => {
                matches!(e.kind(), std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset)
            },
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Protocol(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Self::Protocol(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("bad chunk size".to_string());
        assert_eq!(err.to_string(), "protocol error: bad chunk size");

        let err = Error::Auth("referer rejected".to_string());
        assert_eq!(err.to_string(), "auth error: referer rejected");
    }

    #[test]
    fn test_control_error_classification() {
        let err: Error = ControlError::Republish.into();
        assert!(err.is_republish());
        assert!(!err.is_rtmp_close());
        assert!(err.is_warn_level());

        let err: Error = ControlError::Redirect.into();
        assert!(err.is_redirect());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("io error"));
        assert!(err.is_warn_level());
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: Error = "short read".into();
        assert_eq!(err.to_string(), "protocol error: short read");
    }
}
