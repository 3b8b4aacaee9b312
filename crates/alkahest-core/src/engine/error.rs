use thiserror::Error;

use super::analysis::AnalysisError;
use super::config::ConfigError;
use crate::core::validation::ValidationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {source}")]
    Configuration {
        #[from]
        source: ConfigError,
    },

    #[error("End-state validation failed: {source}")]
    Validation {
        #[from]
        source: ValidationError,
    },

    #[error("Compute platform '{platform}' is unavailable: {message}")]
    PlatformUnavailable { platform: String, message: String },

    #[error("Failed to create a compute context on platform '{platform}': {message}")]
    ContextCreation { platform: String, message: String },

    #[error(
        "Non-finite energy during propagation at iteration {iteration} after \
         {attempts} restart attempt(s)"
    )]
    NumericalInstability { iteration: usize, attempts: usize },

    #[error("Sampler is in stage {actual:?}, expected {expected:?}")]
    InvalidStage {
        expected: super::sampler::SamplerStage,
        actual: super::sampler::SamplerStage,
    },

    #[error("State ensemble length {states} diverged from lambda schedule length {schedule}")]
    EnsembleMismatch { schedule: usize, states: usize },

    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("Storage error for {path}: {source}")]
    Storage {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode or decode a storage record: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Analysis failed: {source}")]
    Analysis {
        #[from]
        source: AnalysisError,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        EngineError::NotImplemented {
            feature: feature.into(),
        }
    }

    pub fn storage(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        EngineError::Storage {
            path: path.into(),
            source,
        }
    }
}
