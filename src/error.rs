use std::fmt::Formatter;
use std::{fmt, io, result};

/// Result type for operations that could result in [`GatewayError`].
pub type Result<T> = result::Result<T, GatewayError>;

/// Error type for generic operations that could result in
/// [`GatewayError::External`].
pub type GenericError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum GatewayError {
    /// A short or malformed protocol message. Surfaced to the client as a
    /// recoverable error during query processing, fatal during startup.
    Framing(String),
    /// A message that is legal on the wire but not in the connection's
    /// current state. Always destroys the connection.
    Protocol(String),
    /// A failure reported by the remote SQL service, already mapped to a
    /// SQLSTATE by the backend client.
    Backend(crate::dataapi::BackendError),
    /// Invalid or missing configuration detected at startup.
    Config(String),
    Io(io::Error),
    /// Gateway has internal invariants that we are unable to ask the
    /// compiler to check for us. This error is raised when one of those
    /// invariants is not verified during execution.
    Internal(String),
    /// Errors originating from outside the gateway's codebase.
    External(GenericError),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Framing(desc) => {
                write!(f, "framing error: {desc}")
            }
            GatewayError::Protocol(desc) => {
                write!(f, "protocol violation: {desc}")
            }
            GatewayError::Backend(err) => {
                write!(f, "backend error: {err}")
            }
            GatewayError::Config(desc) => {
                write!(f, "configuration error: {desc}")
            }
            GatewayError::Io(err) => write!(f, "io error: {err}"),
            GatewayError::Internal(desc) => {
                write!(f, "internal error: {desc}")
            }
            GatewayError::External(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        GatewayError::Io(e)
    }
}

impl From<crate::dataapi::BackendError> for GatewayError {
    fn from(e: crate::dataapi::BackendError) -> Self {
        GatewayError::Backend(e)
    }
}

impl GatewayError {
    pub fn framing<S: Into<String>>(desc: S) -> GatewayError {
        GatewayError::Framing(desc.into())
    }

    pub fn protocol<S: Into<String>>(desc: S) -> GatewayError {
        GatewayError::Protocol(desc.into())
    }
}
