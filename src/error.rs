//! Error types for the Gatekeeper engine.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Gatekeeper operations.
///
/// Store failures are deliberately absent from the request path: the limiter
/// converts them into a degraded [`Decision`](crate::ratelimit::Decision).
/// The `Store` variant only surfaces from setup code such as connecting.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy definition failed validation.
    #[error("Invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// A request named a policy that is not defined.
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// The caller context lacks a component the policy's key generator needs.
    #[error("Policy '{policy}' requires a {component} in the caller context")]
    MissingKeyComponent {
        policy: String,
        component: &'static str,
    },

    /// Counter store setup errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatekeeperError {
    fn from(err: serde_yaml::Error) -> Self {
        GatekeeperError::Config(format!("Failed to parse policy config: {}", err))
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
