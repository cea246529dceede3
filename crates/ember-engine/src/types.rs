//! Parameter and introspection types shared across the engine boundary.

use serde::{Deserialize, Serialize};

/// Vocabulary token id.
pub type Token = i32;

/// Opaque engine-side reference to a loaded LoRA adapter.
///
/// Only meaningful to the engine that issued it; the runtime treats it as
/// a ticket to hand back on attach/detach/drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterRef(pub u64);

//  Load-time parameters

/// Parameters for loading a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Layers to offload to GPU. -1 = all.
    pub n_gpu_layers: i32,
    /// Use memory-mapped I/O.
    pub use_mmap: bool,
    /// Lock model memory (prevent swapping).
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Parameters for creating the inference context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context size in tokens. 0 → use the model's training context size.
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4);
        Self {
            n_ctx: 0,
            n_batch: 2048,
            n_threads: threads,
            n_threads_batch: threads,
        }
    }
}

//  Introspection

/// Static facts about the loaded model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Vocabulary size.
    pub n_vocab: usize,
    /// Active context length in tokens.
    pub n_ctx: u32,
    /// Embedding width.
    pub n_embd: usize,
    /// Architecture name (e.g. `"llama"`, `"qwen2"`).
    pub architecture: String,
}

/// Which media modalities the engine's encoder can ingest.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaSupport {
    pub vision: bool,
    pub audio: bool,
    /// Square edge the vision encoder expects, when it cares.
    pub image_edge: Option<u32>,
}

impl MediaSupport {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.vision || self.audio
    }
}

//  Media payloads crossing the boundary

/// Decoded, normalized RGB8 pixel buffer handed to the vision encoder.
#[derive(Debug, Clone)]
pub struct ImagePixels {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB triples, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

/// Encoder output: a fixed-length embedding plus the number of prompt-token
/// slots the text side must reserve for it.
#[derive(Debug, Clone)]
pub struct MediaEmbedding {
    pub data: Vec<f32>,
    pub n_tokens: usize,
}
