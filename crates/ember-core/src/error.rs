use ember_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Unknown handle")]
    NotFound,

    #[error("Session is closed")]
    AlreadyClosed,

    #[error("A generation is in flight")]
    Busy,

    #[error("Failed to load '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Decode failed: {reason}")]
    DecodeFailed {
        reason: String,
        /// Text generated before the failure; never discarded.
        partial: String,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Grammar error: {0}")]
    Grammar(String),

    #[error("Media ingest error: {0}")]
    Ingest(String),

    #[error("Media supplied but no matching encoder is initialized")]
    MultimodalNotSupported,

    /// Engine failures with no more specific kind above.
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::LoadFailed { path, reason } => SessionError::LoadFailed { path, reason },
            EngineError::OutOfMemory(msg) => SessionError::OutOfMemory(msg),
            EngineError::Decode(reason) => SessionError::DecodeFailed {
                reason,
                partial: String::new(),
            },
            EngineError::InvalidInput(msg) => SessionError::InvalidParam(msg),
            other => SessionError::Engine(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
