//! Error types for mavhub.
//!
//! The library reports failures through the structured [`RouterError`] enum
//! rather than a bag of strings. Endpoint-boundary errors are logged and
//! contained by their tasks; router-open and configuration errors propagate
//! to the caller, which is expected to tear the instance down.

use std::io;
use thiserror::Error;

/// Main error type for mavhub operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration-related errors (parsing, validation, missing files).
    /// Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors (bind failures, socket errors).
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Name or address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Serial port errors (device not found, permission denied, hardware).
    #[error("Serial port error on '{device}': {source}")]
    Serial {
        /// Path to the serial device
        device: String,
        /// Underlying serial error
        #[source]
        source: tokio_serial::Error,
    },

    /// The router instance is already open.
    #[error("Router '{0}' is already open")]
    Busy(String),

    /// MAVLink protocol errors (invalid frames, parsing failures).
    #[error("MAVLink protocol error: {0}")]
    Protocol(String),

    /// File system errors (log files, persisted extension configs).
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        /// Path that caused the error
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Endpoint materialisation errors during `add_endpoints`.
    #[error("Failed to initialize {endpoint_type} endpoint '{name}': {reason}")]
    EndpointInit {
        /// Type of endpoint (tcp, udp, uart, log)
        endpoint_type: String,
        /// Configured endpoint name
        name: String,
        /// Reason for failure
        reason: String,
    },

    /// Thread-manager operations on unknown ids.
    #[error("Thread {0} not found")]
    ThreadNotFound(u32),

    /// Extension-manager failures surfaced to the management plane.
    #[error("Extension error: {0}")]
    Extension(String),

    /// No free slot in the extension-point pool for the requested type.
    #[error("No available extension points for type '{0}'")]
    NoAvailableExtensionPoints(String),

    /// Other unexpected errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new serial error
    pub fn serial(device: impl Into<String>, source: tokio_serial::Error) -> Self {
        Self::Serial {
            device: device.into(),
            source,
        }
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new endpoint initialisation error
    pub fn endpoint_init(
        endpoint_type: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::EndpointInit {
            endpoint_type: endpoint_type.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new extension error
    pub fn extension(msg: impl Into<String>) -> Self {
        Self::Extension(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            endpoint: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<tokio_serial::Error> for RouterError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Serial {
            device: "unknown".to_string(),
            source: err,
        }
    }
}
