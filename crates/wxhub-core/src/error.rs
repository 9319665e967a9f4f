//! Centralized error types for the wxhub application shell.
//!
//! The weather crate carries its own provider/orchestrator taxonomy; this
//! module covers what surrounds it:
//! - Configuration loading and validation
//! - API key resolution

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown {field} name: {value}")]
    UnknownName { field: &'static str, value: String },
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::UnknownName { .. } => {
                "A provider or data kind name in the settings is not recognized."
            }
        }
    }
}

/// API key lookup/storage errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No API key configured for provider: {0}")]
    NotFound(String),

    #[error("Secure storage error: {0}")]
    StorageError(String),
}

impl CredentialError {
    pub fn user_message(&self) -> &'static str {
        match self {
            CredentialError::NotFound(_) => "No API key configured for this provider.",
            CredentialError::StorageError(_) => "Failed to access saved credentials.",
        }
    }
}
