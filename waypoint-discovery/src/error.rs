//! Discovery errors

use thiserror::Error;
use waypoint_config::ConfigError;

/// Service discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No version of {service} satisfies {selector:?}")]
    NoMatchingVersion { service: String, selector: String },

    #[error("Invalid version range {selector:?}: {message}")]
    InvalidVersionRange { selector: String, message: String },

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Deregistration failed: {0}")]
    DeregistrationFailed(String),

    #[error("Singleton {name} {version} is already registered in {environment}")]
    SingletonConflict {
        name: String,
        environment: String,
        version: String,
    },

    #[error("No service is registered on this handle")]
    NotRegistered,

    #[error("Backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown discovery backend: {0:?} (expected \"consul\" or \"etcd\")")]
    UnknownBackend(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DiscoveryError {
    /// Whether the failure may go away on its own (store unreachable,
    /// conflicting singleton still alive).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(_)
            | Self::RegistrationFailed(_)
            | Self::DeregistrationFailed(_)
            | Self::SingletonConflict { .. } => true,
            Self::Backend { status, .. } => *status == 404 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Build a backend error from an unsuccessful response
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Self::Backend {
            status,
            message: message.trim().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
