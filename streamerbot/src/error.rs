use crate::message::{DecodeError, Request, Response};

use std::time::Duration;
use thiserror::Error;
use tungstenite::Error as WsError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while talking to a Streamer.bot instance.
#[derive(Debug, Error)]
pub enum Error {
    // Boxed because tungstenite's errors are large
    /// The socket could not be opened.
    #[error("WebSocket connection failed ({0})")]
    Connection(Box<WsError>),
    /// No open event arrived before the connect timeout elapsed.
    #[error("Timed out opening the WebSocket after {0:?}")]
    ConnectionTimeout(Duration),
    /// The socket closed abnormally while the session was established.
    #[error("Connection lost: {reason} (code {code})")]
    ConnectionLost { code: u16, reason: String },
    /// An in-flight wait was cut short because its connection went away.
    #[error("Connection closed while waiting for {0}")]
    ConnectionClosed(&'static str),
    /// The server rejected our credentials, or demanded credentials we don't have.
    #[error("Authentication failed ({0})")]
    AuthenticationFailed(String),
    /// The first message after open was missing or malformed.
    #[error("Handshake failed ({0})")]
    HandshakeFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Request {} timed out after {timeout:?}", request.kind)]
    RequestTimeout {
        request: Box<Request>,
        timeout: Duration,
    },
    #[error("Request {kind} failed ({})", response.error().unwrap_or("no reason given"))]
    RequestFailed {
        kind: String,
        response: Box<Response>,
    },
    /// A request was issued with an id that is still awaiting its response.
    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(String),
    #[error("Timed out after {0:?} waiting for a custom event response")]
    CustomEventTimeout(Duration),
    #[error("Close handshake not acknowledged within {0:?}")]
    DisconnectTimeout(Duration),
    /// Auto-reconnect gave up.
    #[error("Gave up reconnecting after {0} attempt(s)")]
    RetriesExhausted(u32),
    #[error("Invalid event pattern {0:?}")]
    InvalidEventPattern(String),
    #[error("Unexpected message ({0})")]
    Decode(#[from] DecodeError),
    #[error("JSON error ({0})")]
    Json(#[from] serde_json::Error),
}

impl From<WsError> for Error {
    fn from(value: WsError) -> Self {
        Error::Connection(Box::new(value))
    }
}

impl Error {
    /// Whether a later `connect` has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionLost { .. }
                | Error::ConnectionClosed(_)
                | Error::NotConnected
                | Error::RequestTimeout { .. }
        )
    }
}

/// Human readable description of a WebSocket close code.
pub fn close_reason(code: u16) -> &'static str {
    match code {
        1000 => "Connection closed.",
        1001 => "Endpoint is \"going away\".",
        1002 => "Connection closed due to a protocol error.",
        1003 | 1007 | 1008 | 1010 => "Bad request.",
        1004 => "Reserved.",
        1005 => "Missing status code.",
        1006 => "The connection was closed abnormally.",
        1009 => "Message size limit exceeded.",
        1011 => "Server terminated the connection due to an unexpected condition.",
        1015 => "TLS handshake failure.",
        _ => "Unknown error.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_cover_grouped_codes() {
        assert_eq!(close_reason(1006), "The connection was closed abnormally.");
        assert_eq!(close_reason(1003), close_reason(1010));
        assert_eq!(close_reason(4000), "Unknown error.");
    }

    #[test]
    fn transient_errors() {
        assert!(Error::NotConnected.is_transient());
        assert!(!Error::AuthenticationFailed("nope".into()).is_transient());
        assert!(!Error::RetriesExhausted(3).is_transient());
    }
}
