//! Embeddable inference-session runtime.
//!
//! Manages the session-level state an LLM engine needs beyond the forward
//! pass: owned resource handles, a composable token-sampling pipeline,
//! grammar synthesis for constrained generation, media ingest for
//! multimodal prompts, and end-to-end generation orchestration with
//! streaming and cancellation. The engine itself stays behind the
//! [`ember_engine::Engine`] contract.

pub mod error;
pub mod grammar;
pub mod handle;
pub mod media;
pub mod sampler;
pub mod session;
pub mod snapshot;

pub use error::{Result, SessionError};
pub use grammar::{CompiledGrammar, GrammarMatcher, SchemaOptions, ToolSpec};
pub use handle::{Handle, HandleTable};
pub use media::{
    MediaBatch, MediaFormat, MediaInput, MediaKind, MediaOptions, MediaSource, MediaValidation,
};
pub use sampler::{MirostatMode, SamplerChain, SamplerStage, SamplingParams};
pub use session::{
    AbortHandle, AdapterInfo, FinishReason, GenerateEvent, GenerateRequest, GenerationResult,
    Session, SessionParams, SessionState, TeardownReport,
};

// Re-export the engine contract so embedders need only one dependency.
pub use ember_engine as engine;
