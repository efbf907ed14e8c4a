//! Application error type
//!
//! One error enum for the whole service; handlers map it onto the
//! JSON-RPC style error envelope.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Apply failed at stage {stage}: {message}")]
    ApplyStage { stage: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Tag an error with the apply stage it interrupted.
    pub fn apply_stage(stage: &str, err: impl std::fmt::Display) -> AppError {
        AppError::ApplyStage {
            stage: stage.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
