use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur in execution and streaming operations.
///
/// `Error` is `Clone` so that a terminal error can be surfaced by every
/// subsequent read of a [`Subscriber`](crate::Subscriber).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Operation submitted after shutdown, or the execution context died
    #[error("Execution context closed")]
    ContextClosed,

    /// Blocking wait exceeded the caller's deadline; the operation is still outstanding
    #[error("Operation timed out")]
    Timeout,

    /// Read or write attempted on a closed stream endpoint
    #[error("Stream closed")]
    StreamClosed,

    /// The remote side failed the call or the subscription
    #[error("Remote error: {0}")]
    Remote(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation not allowed in the current state (e.g. changing stream
    /// parameters while the stream is open)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed frame, event or value
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A task or callback panicked
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl Error {
    /// Best-effort message extraction from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::Panicked(msg)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_cloneable() {
        let e = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
        assert!(matches!(c, Error::Io(_)));
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::Protocol(_)));
    }

    #[test]
    fn test_from_panic_payload() {
        let e = Error::from_panic(Box::new("bad"));
        assert!(matches!(e, Error::Panicked(ref m) if m == "bad"));
        let e = Error::from_panic(Box::new(String::from("worse")));
        assert!(matches!(e, Error::Panicked(ref m) if m == "worse"));
        let e = Error::from_panic(Box::new(7u8));
        assert!(matches!(e, Error::Panicked(_)));
    }
}
