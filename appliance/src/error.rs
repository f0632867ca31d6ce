use std::io;

use thiserror::Error;
use wom_common::ConfigError;

use crate::websocket::WsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, refused/reset connections, resource exhaustion. Retried.
    Transient,
    /// Bad handshake or framing. Drops the connection, then reconnects.
    Protocol,
    /// Rejected input such as a malformed config push. Logged and skipped.
    Validation,
    Fatal,
}

impl ErrorKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

#[derive(Debug, Error)]
pub enum WomError {
    #[error(transparent)]
    WebSocket(#[from] WsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no heartbeat from server for {0}s")]
    HeartbeatLost(u64),
    #[error("connect timed out after {0}s")]
    ConnectTimeout(u64),
    #[error("invalid inbound message: {0}")]
    BadMessage(#[from] serde_json::Error),
}

impl WomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WebSocket(err) => classify_ws(err),
            Self::Config(_) | Self::BadMessage(_) => ErrorKind::Validation,
            Self::HeartbeatLost(_) | Self::ConnectTimeout(_) => ErrorKind::Transient,
        }
    }
}

pub fn classify_io(kind: io::ErrorKind) -> ErrorKind {
    use io::ErrorKind::*;

    match kind {
        TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | HostUnreachable | NetworkUnreachable | NetworkDown | AddrNotAvailable | BrokenPipe
        | UnexpectedEof | WouldBlock | Interrupted | OutOfMemory => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

pub fn classify_ws(err: &WsError) -> ErrorKind {
    match err {
        WsError::Io(err) => classify_io(err.kind()),
        WsError::Handshake(_)
        | WsError::UnknownOpcode(_)
        | WsError::Malformed(_)
        | WsError::TooLarge(_)
        | WsError::InvalidUtf8 => ErrorKind::Protocol,
        WsError::Closed => ErrorKind::Transient,
        WsError::InvalidUrl(_) | WsError::Tls(_) => ErrorKind::Fatal,
    }
}

/// Suppresses repeats of the same failure so a flapping link logs once per
/// distinct error until `reset`.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    last: Option<String>,
}

impl ErrorLatch {
    pub fn should_log(&mut self, message: &str) -> bool {
        if self.last.as_deref() == Some(message) {
            return false;
        }
        self.last = Some(message.to_string());
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
