//! Unified error types for the bluelog core library.
//!
//! This module provides a unified error type [`BluelogError`] that covers every
//! failure that can leave the core. Each module also has its own specific error
//! type ([`ConfigError`], [`StorageError`], [`NotifierError`]) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide operators toward resolution
//! - **Context preservation**: Wrapped errors keep the offending path or field
//!
//! Most failures inside the tracker are *not* errors at all: a corrupt registry
//! file is recovered by [`crate::storage::RegistryStore::load`] and a failed
//! webhook is dropped by the notifier worker. What remains here is what the
//! daemon has to act on, chiefly configuration problems and write failures.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`StorageError`]: crate::storage::StorageError
//! [`NotifierError`]: crate::notifier::NotifierError

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all bluelog operations.
#[derive(Debug, Error)]
pub enum BluelogError {
    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// The registry could not be written to durable storage.
    ///
    /// This is fatal for the daemon: continuing would silently lose data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // =========================================================================
    // NOTIFICATION ERRORS
    // =========================================================================
    /// The webhook notifier could not be set up.
    #[error("Notifier setup failed: {0}")]
    NotifierError(String),
}

/// A specialized [`Result`] type for bluelog operations.
pub type Result<T> = std::result::Result<T, BluelogError>;

impl BluelogError {
    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the daemon can keep running without this component.
    ///
    /// A broken notifier only costs notifications; tracking continues.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotifierError(_))
    }

    /// Returns a machine-readable error code for logs and exit reporting.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::NotifierError(_) => "NOTIFIER_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BluelogError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            err @ ConfigError::ValidationError { .. } => {
                Self::ConfigValidationError(err.to_string())
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::storage::StorageError> for BluelogError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<crate::notifier::NotifierError> for BluelogError {
    fn from(err: crate::notifier::NotifierError) -> Self {
        Self::NotifierError(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
