use thiserror::Error;

/// Failures reported by the engine collaborator across the trait boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not supported by this engine: {0}")]
    NotSupported(String),

    #[error("State snapshot failed: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
