//! Error types for genloop-rs

use thiserror::Error;

/// Result type alias for genloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a model or driving generation
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error (config files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config parsing or session construction failed during load
    #[error("Load error: {0}")]
    Load(String),

    /// Generation requested before a session was loaded
    #[error("Session not ready: call load() before generate()")]
    SessionNotReady,

    /// Inference output map lacks an expected tensor
    #[error("Missing inference output: {0}")]
    MissingOutput(String),

    /// Inference output contained invalid data (non-finite logits, bad shape)
    #[error("Invalid inference output: {0}")]
    InvalidOutput(String),

    /// Numeric conversion failed while emitting a token
    #[error("Token decode error: {0}")]
    TokenDecode(String),

    /// Error propagated from the inference session
    #[error("Session error: {0}")]
    Session(String),

    /// Tensor shape mismatch
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Unsupported data type
    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),
}
