//! Error handling for the gateway service
//!
//! Driver and codec failures are sorted into a small taxonomy so the device
//! scheduler can decide how to react: transport failures force a disconnect,
//! everything else only updates the error state.

use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Link-level failure (socket closed, timeout, serial port gone)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered, but with an exception or malformed response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Value could not be converted to or from its wire representation
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration (templates, hints, device entries)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not available for this data point or protocol
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// External state store rejected a request
    #[error("State store error: {0}")]
    StateStore(String),

    /// Filesystem errors while loading templates or configuration
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn transport(msg: impl Into<String>) -> Self {
        GatewayError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GatewayError::Protocol(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        GatewayError::Codec(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        GatewayError::UnsupportedOperation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        GatewayError::StateStore(msg.into())
    }

    pub fn not_connected() -> Self {
        GatewayError::Transport("Not connected".to_string())
    }

    pub fn timeout(what: impl std::fmt::Display) -> Self {
        GatewayError::Transport(format!("Timeout: {}", what))
    }

    pub fn datapoint_not_found(id: impl std::fmt::Display) -> Self {
        GatewayError::Config(format!("Data point not found: {}", id))
    }

    /// Transport failures leave the link in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    /// Whether the driver must be closed so the next tick reconnects cleanly
    pub fn needs_disconnect(&self) -> bool {
        self.is_transport()
    }

    /// Message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Transport(m)
            | Self::Protocol(m)
            | Self::Codec(m)
            | Self::Config(m)
            | Self::UnsupportedOperation(m)
            | Self::StateStore(m)
            | Self::Io(m) => m,
        }
    }

    /// Short category name used in logs and the `info.last_error` state
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::UnsupportedOperation(_) => "unsupported",
            Self::StateStore(_) => "state_store",
            Self::Io(_) => "io",
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof => GatewayError::Transport(err.to_string()),
            _ => GatewayError::Io(err.to_string()),
        }
    }
}

impl From<tokio_serial::Error> for GatewayError {
    fn from(err: tokio_serial::Error) -> Self {
        GatewayError::Transport(format!("Serial: {err}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Config(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Config(format!("YAML: {err}"))
    }
}

impl From<regex::Error> for GatewayError {
    fn from(err: regex::Error) -> Self {
        GatewayError::Config(format!("Regex: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Transport("Operation timed out".to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn transport_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn codec_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Config(format!("{msg}: {e}")))
    }

    fn transport_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Transport(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Protocol(format!("{msg}: {e}")))
    }

    fn codec_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Codec(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(GatewayError::transport("reset").needs_disconnect());
        assert!(GatewayError::not_connected().is_transport());
        assert!(!GatewayError::protocol("exception 0x02").needs_disconnect());
        assert!(!GatewayError::codec("bad length").needs_disconnect());
        assert!(!GatewayError::config("missing").needs_disconnect());
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        assert!(GatewayError::from(reset).is_transport());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no file");
        assert!(matches!(GatewayError::from(missing), GatewayError::Io(_)));
    }

    #[test]
    fn test_error_ext_context() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.codec_error("decode uint32").unwrap_err();
        assert_eq!(err, GatewayError::Codec("decode uint32: boom".to_string()));
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn test_display() {
        let err = GatewayError::unsupported("write to read-only point 'power'");
        assert_eq!(
            err.to_string(),
            "Unsupported operation: write to read-only point 'power'"
        );
    }
}
