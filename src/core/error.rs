//! Gateway error taxonomy
//!
//! Dispatch-time failures (`UnknownProvider`, `InvalidSpec`, the CRUD
//! violations) are returned synchronously and never open a session.
//! In-session failures (`UpstreamUnavailable`, `UpstreamProtocolError`)
//! surface exactly once through the terminal error event.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// A request referenced a provider that is not in the registry.
    UnknownProvider(String),
    /// A malformed provider spec, message shape, or parameter value.
    InvalidSpec(String),
    /// Registry CRUD attempted to reuse an existing provider name.
    Conflict(String),
    /// Registry CRUD attempted to delete a built-in provider.
    Protected(String),
    /// A named provider, conversation, or turn does not exist.
    NotFound(String),
    /// The provider endpoint could not be reached or timed out.
    UpstreamUnavailable(String),
    /// The provider responded with a recognizable error payload.
    UpstreamProtocolError(String),
    /// The conversation store rejected an operation.
    Store(rusqlite::Error),
}

impl GatewayError {
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        GatewayError::InvalidSpec(message.into())
    }

    /// Human-readable message suitable for the caller's sink.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::UnknownProvider(name) => {
                write!(f, "Provider '{name}' not found")
            }
            GatewayError::InvalidSpec(msg) => write!(f, "Invalid request: {msg}"),
            GatewayError::Conflict(name) => {
                write!(f, "Provider '{name}' already exists")
            }
            GatewayError::Protected(name) => {
                write!(f, "Provider '{name}' is built in and cannot be removed")
            }
            GatewayError::NotFound(what) => write!(f, "{what} not found"),
            GatewayError::UpstreamUnavailable(msg) => {
                write!(f, "Provider unreachable: {msg}")
            }
            GatewayError::UpstreamProtocolError(msg) => write!(f, "Provider error: {msg}"),
            GatewayError::Store(source) => write!(f, "Storage error: {source}"),
        }
    }
}

impl StdError for GatewayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            GatewayError::Store(source) => Some(source),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(source: rusqlite::Error) -> Self {
        GatewayError::Store(source)
    }
}
