use std::{fmt, io};

use thiserror::Error;

use crate::{ConnectionState, data::RemoteError, protocol::TransportError};

/// Features a backend may refuse to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Tls,
    Timeout,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Tls => write!(f, "TLS"),
            Feature::Timeout => write!(f, "request timeouts"),
        }
    }
}

/// Reasons a login handshake can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    #[error("Incorrect password.")]
    IncorrectPassword,

    #[error("Bad identification.")]
    BadIdentification,

    #[error("no password supplied and none available from the password source")]
    MissingPassword,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Errors surfaced by a [`Connection`](crate::Connection) and its backends.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("login failed: {0}")]
    LoginFailed(#[from] LoginFailure),

    #[error("{0} is not supported by this backend")]
    Unsupported(Feature),

    #[error("remote error {0}")]
    Remote(#[from] RemoteError),

    #[error("connection terminated: {reason}")]
    Terminated { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("operation not valid while {0:?}")]
    InvalidState(ConnectionState),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("request id space exhausted")]
    RequestIdsExhausted,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    pub(crate) fn terminated(reason: impl Into<String>) -> Self {
        ConnectionError::Terminated {
            reason: reason.into(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionError::Terminated { .. })
    }
}
