//! Startup and serve errors.

use std::{fmt, io};

use crate::fanout::BusError;

/// Errors that stop the server from starting or end it early.
///
/// Request-level failures never reach this type; handlers map them to
/// [`crate::api::error::ApiError`].
#[derive(Debug)]
pub enum ServerError {
    /// Invalid flags or collaborator settings
    Config(String),

    /// Binding, accepting or serving failed
    Io(io::Error),

    /// The fan-out bus could not be reached at startup
    Bus(BusError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Io(err) => write!(f, "listener error: {err}"),
            Self::Bus(err) => write!(f, "fan-out bus error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(_) => None,
            Self::Io(err) => Some(err),
            Self::Bus(err) => Some(err),
        }
    }
}

impl From<BusError> for ServerError {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn config_error_display() {
        let err = ServerError::Config("utc offset out of range: 2000 minutes".to_string());
        assert_eq!(err.to_string(), "configuration error: utc offset out of range: 2000 minutes");
        assert!(err.source().is_none());
    }

    #[test]
    fn io_error_keeps_its_source() {
        let err = ServerError::from(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(matches!(err, ServerError::Io(_)));
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("in use"));
    }
}
