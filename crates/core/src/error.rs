//! LayerMap error types

use thiserror::Error;

/// LayerMap Result type
pub type Result<T> = std::result::Result<T, LayerMapError>;

/// LayerMap error types
#[derive(Debug, Error)]
pub enum LayerMapError {
    // Configuration errors
    #[error("Invalid configuration for model '{model}': {reason}")]
    InvalidConfig { model: String, reason: String },

    #[error("Invalid device label '{0}': expected 'cuda:N' or 'N'")]
    DeviceLabel(String),

    #[error("Fixed placement '{component}' targets device {device}, but only {available} device(s) are visible")]
    UnknownDevice {
        component: String,
        device: usize,
        available: usize,
    },

    // Device runtime errors
    #[error("Device query failed on device {device:?}: {reason}")]
    DeviceQuery {
        device: Option<usize>,
        reason: String,
    },

    // Collaborator errors
    #[error("{stage} failed: {reason}")]
    Collaborator { stage: &'static str, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LayerMapError {
    /// Shorthand for a configuration error on `model`.
    pub fn config(model: impl Into<String>, reason: impl Into<String>) -> Self {
        LayerMapError::InvalidConfig {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a failed device-runtime call.
    pub fn device_query(device: Option<usize>, reason: impl std::fmt::Display) -> Self {
        LayerMapError::DeviceQuery {
            device,
            reason: reason.to_string(),
        }
    }

    /// Wrap a failure reported by a model or adapter loader.
    pub fn collaborator(stage: &'static str, reason: impl std::fmt::Display) -> Self {
        LayerMapError::Collaborator {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Allocation is deterministic given its inputs, so nothing is worth retrying.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// True for errors the caller fixes by editing configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LayerMapError::InvalidConfig { .. }
                | LayerMapError::DeviceLabel(_)
                | LayerMapError::UnknownDevice { .. }
                | LayerMapError::Json(_)
                | LayerMapError::Toml(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = LayerMapError::config("chatglm-6b", "layers (30) exceeds total_layers (28)");
        assert!(err.is_config_error());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Invalid configuration for model 'chatglm-6b': layers (30) exceeds total_layers (28)"
        );

        let err = LayerMapError::device_query(Some(1), "CUDA_ERROR_INVALID_DEVICE");
        assert!(!err.is_config_error());
        assert!(!err.is_retryable());
    }
}
