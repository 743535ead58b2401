//! Error types and handling for Talos
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Talos operations
pub type Result<T> = std::result::Result<T, TalosError>;

/// Main error type for Talos
#[derive(Debug, Error)]
pub enum TalosError {
    /// Configuration-related errors, including battery profile refusals
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// D-Bus communication errors
    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl TalosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        TalosError::Config {
            message: message.into(),
        }
    }

    /// Create a new D-Bus error
    pub fn dbus<S: Into<String>>(message: S) -> Self {
        TalosError::DBus {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        TalosError::Web {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        TalosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        TalosError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        TalosError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        TalosError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TalosError {
    fn from(err: std::io::Error) -> Self {
        TalosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for TalosError {
    fn from(err: serde_yaml::Error) -> Self {
        TalosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TalosError {
    fn from(err: serde_json::Error) -> Self {
        TalosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<zbus::Error> for TalosError {
    fn from(err: zbus::Error) -> Self {
        TalosError::dbus(err.to_string())
    }
}

impl From<chrono::ParseError> for TalosError {
    fn from(err: chrono::ParseError) -> Self {
        TalosError::validation("datetime", &err.to_string())
    }
}
