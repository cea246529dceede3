//! Deterministic scripted engine shared by the integration suites.
//!
//! The vocabulary is printable ASCII (one char per token) plus a final
//! end-of-generation token. Logits are a pure hash of the decode history,
//! so identical prompts always produce identical distributions — which is
//! what the determinism and adapter-lifecycle suites rely on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ember_engine::{
    AdapterRef, ContextParams, Engine, EngineBackend, EngineError, ImagePixels, MediaEmbedding,
    MediaSupport, ModelInfo, ModelParams, Token, TokenView,
};

const ASCII_START: u8 = 0x20;
const ASCII_END: u8 = 0x7E;
const N_ASCII: usize = (ASCII_END - ASCII_START + 1) as usize; // 95

pub struct MockEngine {
    history: Vec<Token>,
    loaded_adapters: HashMap<u64, PathBuf>,
    attached_adapters: HashMap<u64, f32>,
    next_adapter: u64,
    media: MediaSupport,
    decode_calls: usize,
    fail_decode_after: Option<usize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            loaded_adapters: HashMap::new(),
            attached_adapters: HashMap::new(),
            next_adapter: 1,
            media: MediaSupport::none(),
            decode_calls: 0,
            fail_decode_after: None,
        }
    }

    fn eog(&self) -> Token {
        N_ASCII as Token
    }

    /// Pure hash of (history, token, attached adapters).
    fn logit_for(&self, token: Token) -> f32 {
        let mut h: u64 = 0x9E37_79B9_7F4A_7C15 ^ (self.history.len() as u64);
        for &t in self.history.iter().rev().take(4) {
            h = h.wrapping_mul(31).wrapping_add(t as u64 ^ 0xABCD);
        }
        h = h
            .wrapping_mul(6364136223846793005)
            .wrapping_add((token as u64).wrapping_mul(2654435761));
        let base = ((h >> 33) as f32 / (1u64 << 31) as f32) * 4.0 - 2.0;

        // Each attached adapter strongly favors one fixed token, so its
        // effect on greedy output is unmistakable and fully reversible.
        let delta: f32 = self
            .attached_adapters
            .iter()
            .map(|(r, scale)| {
                let favored = (r.wrapping_mul(7919) % N_ASCII as u64) as Token;
                if token == favored { scale * 100.0 } else { 0.0 }
            })
            .sum();
        base + delta
    }
}

impl TokenView for MockEngine {
    fn n_vocab(&self) -> usize {
        N_ASCII + 1
    }

    fn token_piece(&self, token: Token) -> String {
        if (0..N_ASCII as Token).contains(&token) {
            ((token as u8 + ASCII_START) as char).to_string()
        } else {
            String::new()
        }
    }

    fn is_eog(&self, token: Token) -> bool {
        token == self.eog()
    }
}

impl Engine for MockEngine {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            n_vocab: self.n_vocab(),
            n_ctx: 4096,
            n_embd: 16,
            architecture: "mock".into(),
        }
    }

    fn tokenize(&self, text: &str, _add_special: bool) -> Result<Vec<Token>, EngineError> {
        text.chars()
            .map(|c| {
                let b = c as u32;
                if (ASCII_START as u32..=ASCII_END as u32).contains(&b) {
                    Ok((b as u8 - ASCII_START) as Token)
                } else {
                    Err(EngineError::InvalidInput(format!(
                        "character {c:?} is outside the mock vocabulary"
                    )))
                }
            })
            .collect()
    }

    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        Ok(tokens.iter().map(|&t| self.token_piece(t)).collect())
    }

    fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError> {
        self.decode_calls += 1;
        if let Some(limit) = self.fail_decode_after {
            if self.decode_calls > limit {
                return Err(EngineError::Decode(format!(
                    "scripted failure at decode call {}",
                    self.decode_calls
                )));
            }
        }
        self.history.extend_from_slice(tokens);
        Ok(())
    }

    fn decode_embeddings(&mut self, _data: &[f32], n_tokens: usize) -> Result<(), EngineError> {
        // Media slots occupy history positions like ordinary tokens.
        self.history.extend(std::iter::repeat(-1).take(n_tokens));
        Ok(())
    }

    fn logits(&self) -> Result<Vec<f32>, EngineError> {
        if self.history.is_empty() {
            return Err(EngineError::Decode("no decoded position".into()));
        }
        Ok((0..self.n_vocab() as Token)
            .map(|t| self.logit_for(t))
            .collect())
    }

    fn clear_cache(&mut self) {
        self.history.clear();
    }

    fn load_adapter(&mut self, path: &Path) -> Result<AdapterRef, EngineError> {
        if path.to_string_lossy().contains("missing") {
            return Err(EngineError::LoadFailed {
                path: path.display().to_string(),
                reason: "no such adapter".into(),
            });
        }
        let id = self.next_adapter;
        self.next_adapter += 1;
        self.loaded_adapters.insert(id, path.to_path_buf());
        Ok(AdapterRef(id))
    }

    fn attach_adapter(&mut self, adapter: AdapterRef, scale: f32) -> Result<(), EngineError> {
        if !self.loaded_adapters.contains_key(&adapter.0) {
            return Err(EngineError::InvalidInput("unknown adapter ref".into()));
        }
        self.attached_adapters.insert(adapter.0, scale);
        Ok(())
    }

    fn detach_adapter(&mut self, adapter: AdapterRef) -> Result<(), EngineError> {
        self.attached_adapters
            .remove(&adapter.0)
            .map(drop)
            .ok_or_else(|| EngineError::InvalidInput("adapter is not attached".into()))
    }

    fn drop_adapter(&mut self, adapter: AdapterRef) -> Result<(), EngineError> {
        if self.attached_adapters.contains_key(&adapter.0) {
            return Err(EngineError::InvalidInput(
                "adapter must be detached before release".into(),
            ));
        }
        self.loaded_adapters
            .remove(&adapter.0)
            .map(drop)
            .ok_or_else(|| EngineError::InvalidInput("unknown adapter ref".into()))
    }

    fn init_media_encoder(&mut self, projector_path: &Path) -> Result<(), EngineError> {
        if projector_path.to_string_lossy().contains("missing") {
            return Err(EngineError::LoadFailed {
                path: projector_path.display().to_string(),
                reason: "no such projector".into(),
            });
        }
        self.media = MediaSupport {
            vision: true,
            audio: true,
            image_edge: Some(64),
        };
        Ok(())
    }

    fn media_support(&self) -> MediaSupport {
        self.media
    }

    fn encode_image(&mut self, image: &ImagePixels) -> Result<MediaEmbedding, EngineError> {
        Ok(MediaEmbedding {
            data: vec![image.width as f32; 16],
            n_tokens: 4,
        })
    }

    fn encode_audio(
        &mut self,
        samples: &[f32],
        _sample_rate: u32,
    ) -> Result<MediaEmbedding, EngineError> {
        Ok(MediaEmbedding {
            data: vec![samples.len() as f32; 16],
            n_tokens: 2,
        })
    }

    fn save_state(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self
            .history
            .iter()
            .flat_map(|t| t.to_le_bytes())
            .collect())
    }

    fn load_state(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        if blob.len() % 4 != 0 {
            return Err(EngineError::State("blob length not a token multiple".into()));
        }
        self.history = blob
            .chunks_exact(4)
            .map(|b| Token::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(())
    }
}

/// Backend producing [`MockEngine`]s, with scripted failure knobs.
#[derive(Default)]
pub struct MockBackend {
    pub fail_decode_after: Option<usize>,
}

impl EngineBackend for MockBackend {
    fn load(
        &self,
        model_path: &Path,
        _model: &ModelParams,
        _context: &ContextParams,
    ) -> Result<Box<dyn Engine>, EngineError> {
        if model_path.to_string_lossy().contains("missing") {
            return Err(EngineError::LoadFailed {
                path: model_path.display().to_string(),
                reason: "no such model".into(),
            });
        }
        let mut engine = MockEngine::new();
        engine.fail_decode_after = self.fail_decode_after;
        Ok(Box::new(engine))
    }
}
