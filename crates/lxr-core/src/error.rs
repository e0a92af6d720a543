//! Unified error types for lxr

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all lxr operations
#[derive(Error, Debug)]
pub enum LxrError {
    // Request errors
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Host errors
    #[error("Host operation failed: {0}")]
    Host(String),

    #[error("Command `{command}` exited with {exit_code}: {stderr}")]
    Exec {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{target} not ready after {attempts} attempts ({elapsed:?}): {last_status}")]
    Timeout {
        target: String,
        attempts: u32,
        elapsed: Duration,
        last_status: String,
    },

    // Registration errors
    #[error("Authentication failed: {message} (response: {body})")]
    Auth { message: String, body: String },

    #[error("Not found: {message} (response: {body})")]
    NotFound { message: String, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Interrupted by operator")]
    Interrupted,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using LxrError
pub type Result<T> = std::result::Result<T, LxrError>;
