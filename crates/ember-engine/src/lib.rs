//! Contract between the ember session runtime and a native LLM engine.
//!
//! The engine — tokenizer, transformer forward pass, KV-cache, quantized
//! math — lives behind the [`Engine`] trait and is assumed correct. This
//! crate defines only the call surface the runtime needs: tokenization,
//! incremental decode, logits access, adapter management, the multimodal
//! encoder, and opaque state snapshots.

pub mod error;
pub mod hook;
pub mod types;

use std::path::Path;

pub use error::EngineError;
pub use types::{
    AdapterRef, ContextParams, ImagePixels, MediaEmbedding, MediaSupport, ModelInfo, ModelParams,
    Token,
};

/// Read-only vocabulary access, split out so the sampling layer can be
/// exercised without a full engine.
pub trait TokenView {
    /// Vocabulary size.
    fn n_vocab(&self) -> usize;

    /// Text piece for a single token id.
    fn token_piece(&self, token: Token) -> String;

    /// Whether `token` ends generation (EOS/EOT family).
    fn is_eog(&self, token: Token) -> bool;
}

/// A loaded model plus inference context, owned by exactly one session.
///
/// All state-mutating calls take `&mut self`; the runtime serializes access
/// from a single logical owner rather than locking.
pub trait Engine: TokenView + Send {
    fn model_info(&self) -> ModelInfo;

    //  Text

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError>;

    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError>;

    /// Process a batch of tokens, advancing the KV-cache.
    fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError>;

    /// Feed pre-computed media embeddings into the decode stream,
    /// occupying `n_tokens` positions.
    fn decode_embeddings(&mut self, data: &[f32], n_tokens: usize) -> Result<(), EngineError>;

    /// Vocabulary-sized logits for the last decoded position.
    fn logits(&self) -> Result<Vec<f32>, EngineError>;

    /// Drop all KV-cache state.
    fn clear_cache(&mut self);

    //  Adapters

    fn load_adapter(&mut self, path: &Path) -> Result<AdapterRef, EngineError>;

    fn attach_adapter(&mut self, adapter: AdapterRef, scale: f32) -> Result<(), EngineError>;

    fn detach_adapter(&mut self, adapter: AdapterRef) -> Result<(), EngineError>;

    /// Release the adapter's memory. Must be detached first.
    fn drop_adapter(&mut self, adapter: AdapterRef) -> Result<(), EngineError>;

    //  Media encoder

    fn init_media_encoder(&mut self, projector_path: &Path) -> Result<(), EngineError>;

    fn media_support(&self) -> MediaSupport;

    fn encode_image(&mut self, image: &ImagePixels) -> Result<MediaEmbedding, EngineError>;

    fn encode_audio(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<MediaEmbedding, EngineError>;

    //  Persisted state

    /// Serialize KV-cache + token history to an opaque blob.
    fn save_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Restore a blob produced by [`Engine::save_state`].
    fn load_state(&mut self, blob: &[u8]) -> Result<(), EngineError>;
}

/// Loads models and produces [`Engine`] handles.
pub trait EngineBackend {
    fn load(
        &self,
        model_path: &Path,
        model: &ModelParams,
        context: &ContextParams,
    ) -> Result<Box<dyn Engine>, EngineError>;
}
