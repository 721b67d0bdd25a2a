//! Error handling for the edge translation service
//!
//! One error type for the whole service; protocol drivers, the codec layer
//! and the supervisor all return [`Result`].

use thiserror::Error;

/// Edge service error type
#[derive(Error, Debug, Clone)]
pub enum EdgeSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// General protocol communication errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Not connected error
    #[error("Not connected")]
    NotConnected,

    /// Not supported error
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Payload decode errors (invalid JSON/XML, unparseable number, bad offset)
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// MQTT transport errors
    #[error("MQTT error: {0}")]
    MqttError(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Invalid parameter errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Metric not found errors
    #[error("Metric not found: {0}")]
    MetricNotFound(String),

    /// Invalid state transitions
    #[error("State error: {0}")]
    StateError(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the edge translation service
pub type Result<T> = std::result::Result<T, EdgeSrvError>;

impl From<std::io::Error> for EdgeSrvError {
    fn from(err: std::io::Error) -> Self {
        EdgeSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for EdgeSrvError {
    fn from(err: serde_json::Error) -> Self {
        EdgeSrvError::SerializationError(format!("JSON error: {err}"))
    }
}

impl From<reqwest::Error> for EdgeSrvError {
    fn from(err: reqwest::Error) -> Self {
        EdgeSrvError::HttpError(err.to_string())
    }
}

impl From<rumqttc::ClientError> for EdgeSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        EdgeSrvError::MqttError(err.to_string())
    }
}

impl From<figment::Error> for EdgeSrvError {
    fn from(err: figment::Error) -> Self {
        EdgeSrvError::ConfigError(err.to_string())
    }
}

// Helper constructors for the most common kinds
impl EdgeSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        EdgeSrvError::ConfigError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        EdgeSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        EdgeSrvError::ConnectionError(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        EdgeSrvError::DecodeError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EdgeSrvError::InternalError(msg.into())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn decode_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| EdgeSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| EdgeSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn decode_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| EdgeSrvError::DecodeError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| EdgeSrvError::InternalError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EdgeSrvError::ConfigError("missing broker".to_string());
        assert!(err.to_string().contains("missing broker"));

        let err = EdgeSrvError::DecodeError("bad offset".to_string());
        assert!(err.to_string().contains("Decode"));
    }

    #[test]
    fn test_error_ext_context() {
        let base: std::result::Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let wrapped = base.context("formatting payload");
        assert!(matches!(wrapped, Err(EdgeSrvError::InternalError(_))));
    }
}
