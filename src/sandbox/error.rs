//! Error types for the container strategy.
//!
//! Typed errors let callers match on specific Docker failure modes;
//! they surface to the pipeline as [`PlatformError::Sandbox`].

use crate::error::PlatformError;

/// Errors raised while driving Docker for a container session.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// Network/iptables setup failed.
    #[error("Network setup failed: {message}")]
    NetworkSetupFailed { message: String },

    /// Container operation failed (create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },
}

impl ContainerError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `NetworkSetupFailed` error.
    pub fn network_setup_failed(message: impl Into<String>) -> Self {
        Self::NetworkSetupFailed {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }
}

impl From<ContainerError> for PlatformError {
    fn from(err: ContainerError) -> Self {
        PlatformError::sandbox(err.to_string())
    }
}
