//! Session orchestration.
//!
//! A [`Session`] is the single owner of one engine handle plus everything
//! hanging off it: the active LoRA adapter set, sampler chains, an optional
//! grammar constraint, and the generation state machine. It is not
//! internally synchronized — one logical thread owns a session end to end;
//! run several sessions for parallelism.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use ember_engine::{
    AdapterRef, ContextParams, Engine, EngineBackend, EngineError, ModelInfo, ModelParams,
    TokenView,
};

use crate::error::{Result, SessionError};
use crate::grammar::CompiledGrammar;
use crate::handle::{Handle, HandleTable};
use crate::media::{self, MediaInput};
use crate::sampler::{SamplerChain, SamplingParams};
use crate::snapshot;

//  Parameters

/// Everything needed to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub model_path: PathBuf,
    #[serde(default)]
    pub model: ModelParams,
    #[serde(default)]
    pub context: ContextParams,
    /// Multimodal projector; the media encoder is initialized at open
    /// when present.
    #[serde(default)]
    pub media_projector: Option<PathBuf>,
    #[serde(default)]
    pub sampling: SamplingParams,
}

impl SessionParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            model: ModelParams::default(),
            context: ContextParams::default(),
            media_projector: None,
            sampling: SamplingParams::default(),
        }
    }
}

//  State machine

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PromptEncoding,
    Generating,
    Completed,
    Aborted,
    Failed,
    Closed,
}

impl SessionState {
    /// States in which the session accepts reconfiguration and new
    /// generation requests.
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Completed | Self::Aborted | Self::Failed
        )
    }
}

//  Cancellation

/// Cooperative cancellation flag, polled at every iteration boundary of
/// the generation loop. Cloneable; hand one copy to the consumer.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

//  Requests and results

/// Parameters for a generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Stop-word strings.
    pub stop_words: Vec<String>,
    /// Media payloads spliced ahead of the prompt.
    pub media: Vec<MediaInput>,
    /// Add BOS/EOS-style special tokens when tokenizing.
    pub add_special: bool,
    /// Per-request sampling override; the session's parameters otherwise.
    pub sampling: Option<SamplingParams>,
    pub abort: Option<AbortHandle>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 128,
            add_special: true,
            ..Self::default()
        }
    }
}

/// Events emitted during streaming generation.
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    /// A new text piece was decoded.
    Token(String),
    /// Generation finished.
    Done {
        finish_reason: FinishReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An error occurred mid-generation.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop (EOS / EOT token).
    Stop,
    /// Reached `max_tokens` or the context limit.
    Length,
    /// Matched a stop word.
    StopWord(String),
    /// Cancelled at an iteration boundary; partial output preserved.
    Aborted,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final outcome of a generation request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

//  Adapters

struct AdapterEntry {
    engine_ref: AdapterRef,
    path: PathBuf,
    scale: f32,
    active: bool,
}

/// Caller-visible adapter facts.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub path: PathBuf,
    /// Only meaningful while `active` is true.
    pub scale: f32,
    pub active: bool,
}

//  Teardown

/// Release failures collected during [`Session::close`]. Teardown never
/// stops early; every resource is attempted.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<(String, SessionError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

//  Session

pub struct Session {
    engine: Option<Box<dyn Engine>>,
    state: SessionState,
    info: ModelInfo,
    sampling: SamplingParams,
    grammar: Option<Arc<CompiledGrammar>>,
    /// Caller-attached chain; takes precedence over lazily built ones.
    custom_chain: Option<SamplerChain>,
    /// Registered standalone chains, selectable by handle.
    chains: HandleTable<SamplerChain>,
    adapters: HandleTable<AdapterEntry>,
    /// Application order — load order, preserved across remove/reload.
    adapter_order: Vec<Handle>,
}

impl Session {
    /// Load the model and context through the backend and open a session
    /// around the resulting engine handle.
    pub fn open(backend: &dyn EngineBackend, params: &SessionParams) -> Result<Self> {
        info!(model = %params.model_path.display(), "opening session");
        let mut engine = backend.load(&params.model_path, &params.model, &params.context)?;
        if let Some(projector) = &params.media_projector {
            engine.init_media_encoder(projector)?;
        }
        let info = engine.model_info();
        debug!(
            n_vocab = info.n_vocab,
            n_ctx = info.n_ctx,
            architecture = %info.architecture,
            "session opened"
        );
        Ok(Self {
            engine: Some(engine),
            state: SessionState::Idle,
            info,
            sampling: params.sampling.clone(),
            grammar: None,
            custom_chain: None,
            chains: HandleTable::new(),
            adapters: HandleTable::new(),
            adapter_order: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model_info(&self) -> Result<&ModelInfo> {
        self.ensure_open()?;
        Ok(&self.info)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        Ok(())
    }

    fn ensure_resting(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.state.is_resting() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    fn engine_mut(&mut self) -> Result<&mut Box<dyn Engine>> {
        self.engine.as_mut().ok_or(SessionError::AlreadyClosed)
    }

    //  Sampling configuration

    /// Replace the session's sampling parameters. The chain itself is
    /// built lazily at the next generation.
    pub fn set_sampling(&mut self, params: SamplingParams) -> Result<()> {
        self.ensure_resting()?;
        self.sampling = params;
        Ok(())
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Install a compiled grammar as a hard constraint on generation. It
    /// becomes the first stage of the chain built for each request.
    pub fn install_grammar(&mut self, grammar: Arc<CompiledGrammar>) -> Result<()> {
        self.ensure_resting()?;
        debug!(root = grammar.root(), "grammar installed");
        self.grammar = Some(grammar);
        Ok(())
    }

    pub fn clear_grammar(&mut self) -> Result<()> {
        self.ensure_resting()?;
        self.grammar = None;
        Ok(())
    }

    /// Attach a standalone chain, overriding parameter-built chains until
    /// [`Self::detach_chain`].
    pub fn attach_chain(&mut self, chain: SamplerChain) -> Result<()> {
        self.ensure_resting()?;
        self.custom_chain = Some(chain);
        Ok(())
    }

    pub fn detach_chain(&mut self) -> Option<SamplerChain> {
        self.custom_chain.take()
    }

    /// Park a chain in the session's registry for later selection.
    pub fn register_chain(&mut self, chain: SamplerChain) -> Result<Handle> {
        self.ensure_open()?;
        Ok(self.chains.insert(chain))
    }

    /// Move a registered chain into the active slot. The handle is
    /// consumed by the move.
    pub fn select_chain(&mut self, handle: Handle) -> Result<()> {
        self.ensure_resting()?;
        let chain = self.chains.release(handle)?;
        self.custom_chain = Some(chain);
        Ok(())
    }

    pub fn release_chain(&mut self, handle: Handle) -> Result<()> {
        self.ensure_resting()?;
        self.chains.release(handle).map(drop)
    }

    //  Adapters

    /// Load a LoRA adapter. It is tracked but inactive until
    /// [`Self::set_adapter_scale`] attaches it.
    pub fn load_adapter(&mut self, path: &Path) -> Result<Handle> {
        self.ensure_resting()?;
        let engine = self.engine_mut()?;
        let engine_ref = engine.load_adapter(path)?;
        let handle = self.adapters.insert(AdapterEntry {
            engine_ref,
            path: path.to_path_buf(),
            scale: 1.0,
            active: false,
        });
        self.adapter_order.push(handle);
        info!(path = %path.display(), "adapter loaded");
        Ok(handle)
    }

    /// Attach (or re-attach) the adapter at `scale`, activating it.
    pub fn set_adapter_scale(&mut self, handle: Handle, scale: f32) -> Result<()> {
        self.ensure_resting()?;
        if !(0.0..=2.0).contains(&scale) {
            return Err(SessionError::InvalidParam(format!(
                "adapter scale must be in [0, 2], got {scale}"
            )));
        }
        let entry = self.adapters.get_mut(handle).ok_or(SessionError::NotFound)?;
        let engine = self.engine.as_mut().ok_or(SessionError::AlreadyClosed)?;
        engine.attach_adapter(entry.engine_ref, scale)?;
        entry.scale = scale;
        entry.active = true;
        Ok(())
    }

    /// Detach the adapter from the engine, then release its memory.
    pub fn remove_adapter(&mut self, handle: Handle) -> Result<()> {
        self.ensure_resting()?;
        let entry = self.adapters.release(handle)?;
        self.adapter_order.retain(|h| *h != handle);
        let engine = self.engine.as_mut().ok_or(SessionError::AlreadyClosed)?;
        if entry.active {
            engine.detach_adapter(entry.engine_ref)?;
        }
        engine.drop_adapter(entry.engine_ref)?;
        debug!(path = %entry.path.display(), "adapter removed");
        Ok(())
    }

    pub fn adapter_info(&self, handle: Handle) -> Result<AdapterInfo> {
        let entry = self.adapters.get(handle).ok_or(SessionError::NotFound)?;
        Ok(AdapterInfo {
            path: entry.path.clone(),
            scale: entry.scale,
            active: entry.active,
        })
    }

    /// Adapters in application order.
    pub fn adapters(&self) -> Vec<AdapterInfo> {
        self.adapter_order
            .iter()
            .filter_map(|h| self.adapters.get(*h))
            .map(|e| AdapterInfo {
                path: e.path.clone(),
                scale: e.scale,
                active: e.active,
            })
            .collect()
    }

    //  Media

    /// Run the ingest pipeline without generating: validate-only access.
    pub fn validate_media(&self, input: &MediaInput) -> Result<media::MediaValidation> {
        self.ensure_open()?;
        let engine = self.engine.as_ref().ok_or(SessionError::AlreadyClosed)?;
        media::validate(input, &engine.media_support())
    }

    /// Encode a batch of media inputs to embeddings, independently of a
    /// generation request.
    pub fn process_media_batch(&mut self, inputs: &[MediaInput]) -> Result<media::MediaBatch> {
        self.ensure_resting()?;
        let engine = self.engine_mut()?;
        Ok(media::process_batch(engine.as_mut(), inputs))
    }

    //  Generation

    /// Run a request to completion, collecting the generated text.
    pub fn generate(&mut self, request: &GenerateRequest) -> Result<GenerationResult> {
        self.run_generation(request, &mut |_| true)
    }

    /// Run a request, handing each decoded piece to `on_piece`. Returning
    /// `false` from the callback cancels at that boundary, exactly like an
    /// abort flag.
    pub fn generate_with(
        &mut self,
        request: &GenerateRequest,
        mut on_piece: impl FnMut(&str) -> bool,
    ) -> Result<GenerationResult> {
        self.run_generation(request, &mut |event| match event {
            GenerateEvent::Token(piece) => on_piece(&piece),
            _ => true,
        })
    }

    /// Run a request, streaming [`GenerateEvent`]s over `tx`.
    ///
    /// Blocking; intended to be driven inside `spawn_blocking`. Dropping
    /// the receiver cancels the generation at the next token boundary.
    pub fn generate_stream(
        &mut self,
        request: &GenerateRequest,
        tx: mpsc::Sender<GenerateEvent>,
    ) -> Result<GenerationResult> {
        self.run_generation(request, &mut |event| tx.blocking_send(event).is_ok())
    }

    fn run_generation(
        &mut self,
        request: &GenerateRequest,
        emit: &mut dyn FnMut(GenerateEvent) -> bool,
    ) -> Result<GenerationResult> {
        self.ensure_resting()?;

        // Build (or borrow) the chain first: parameter errors must fail
        // fast, before any engine state is touched.
        let had_custom = self.custom_chain.is_some();
        let mut chain = match self.custom_chain.take() {
            Some(chain) => chain,
            None => {
                let params = request.sampling.as_ref().unwrap_or(&self.sampling);
                params.build_chain(self.grammar.clone())?
            }
        };
        chain.reset();

        self.state = SessionState::PromptEncoding;
        let prepared = {
            let engine = match self.engine.as_mut() {
                Some(e) => e,
                None => return Err(SessionError::AlreadyClosed),
            };
            prepare_prompt(engine.as_mut(), request)
        };
        let (prompt_tokens, n_past) = match prepared {
            Ok(v) => v,
            Err(e) => {
                if had_custom {
                    self.custom_chain = Some(chain);
                }
                self.state = failure_state(&e);
                return Err(e);
            }
        };

        self.state = SessionState::Generating;
        let outcome = {
            let engine = match self.engine.as_mut() {
                Some(e) => e,
                None => return Err(SessionError::AlreadyClosed),
            };
            decode_loop(
                engine.as_mut(),
                &self.info,
                &mut chain,
                request,
                emit,
                prompt_tokens,
                n_past,
            )
        };

        if had_custom {
            self.custom_chain = Some(chain);
        }
        match &outcome {
            Ok(result) => {
                self.state = if result.finish_reason == FinishReason::Aborted {
                    SessionState::Aborted
                } else {
                    SessionState::Completed
                };
            }
            Err(e) => self.state = failure_state(e),
        }
        outcome
    }

    /// Drop all KV-cache state, forgetting the decoded history. Refused
    /// while a generation is in flight, like every mutating call.
    pub fn clear_cache(&mut self) -> Result<()> {
        self.ensure_resting()?;
        self.engine_mut()?.clear_cache();
        self.state = SessionState::Idle;
        Ok(())
    }

    //  Persisted state

    /// Save the engine's opaque KV snapshot to `path`.
    pub fn save_state(&mut self, path: &Path) -> Result<()> {
        self.ensure_resting()?;
        let engine = self.engine.as_ref().ok_or(SessionError::AlreadyClosed)?;
        let blob = engine.save_state()?;
        snapshot::write_snapshot(path, &blob)
    }

    /// Restore a snapshot previously written by [`Self::save_state`].
    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        self.ensure_resting()?;
        let blob = snapshot::read_snapshot(path)?;
        let engine = self.engine_mut()?;
        engine.load_state(&blob)?;
        Ok(())
    }

    //  Teardown

    /// Release every tracked resource, then free the engine handle.
    ///
    /// Failures are collected into the report rather than aborting
    /// teardown; every resource is attempted exactly once. All calls on
    /// the session afterwards fail with `AlreadyClosed`.
    pub fn close(&mut self) -> Result<TeardownReport> {
        if self.state == SessionState::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        let mut report = TeardownReport::default();

        // Sampler chains first: a grammar stage may hold an activation.
        self.custom_chain = None;
        self.chains.release_all(drop);
        self.grammar = None;

        // Adapters detach strictly before the engine handle goes away.
        if let Some(engine) = self.engine.as_mut() {
            self.adapters.release_all(|entry| {
                if entry.active {
                    if let Err(e) = engine.detach_adapter(entry.engine_ref) {
                        report
                            .failures
                            .push((format!("detach {}", entry.path.display()), e.into()));
                    }
                }
                if let Err(e) = engine.drop_adapter(entry.engine_ref) {
                    report
                        .failures
                        .push((format!("release {}", entry.path.display()), e.into()));
                }
            });
        }
        self.adapter_order.clear();

        // Engine handle freed last.
        self.engine = None;
        self.state = SessionState::Closed;
        info!(failures = report.failures.len(), "session closed");
        Ok(report)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.close();
        }
    }
}

//  Generation internals

/// Which resting state a failed request leaves the session in: engine
/// failures poison the request (`Failed`); local validation failures do
/// not touch engine state and leave the session `Idle`.
fn failure_state(err: &SessionError) -> SessionState {
    match err {
        SessionError::DecodeFailed { .. }
        | SessionError::Engine(_)
        | SessionError::OutOfMemory(_) => SessionState::Failed,
        _ => SessionState::Idle,
    }
}

fn with_partial(err: EngineError, text: &str) -> SessionError {
    match SessionError::from(err) {
        SessionError::DecodeFailed { reason, .. } => SessionError::DecodeFailed {
            reason,
            partial: text.to_string(),
        },
        other => other,
    }
}

/// Media splice + prompt tokenize + prompt decode.
/// Returns (prompt token count, next position).
fn prepare_prompt(engine: &mut dyn Engine, request: &GenerateRequest) -> Result<(u32, i32)> {
    let mut prompt_tokens = 0u32;

    // Media embeddings go ahead of the text, reserving the token slots
    // the encoder reported.
    for input in &request.media {
        let embedding = media::process(engine, input)?;
        engine.decode_embeddings(&embedding.data, embedding.n_tokens)?;
        prompt_tokens += embedding.n_tokens as u32;
    }

    let tokens = engine.tokenize(&request.prompt, request.add_special)?;
    if tokens.is_empty() && prompt_tokens == 0 {
        return Err(SessionError::InvalidParam("empty prompt".into()));
    }
    if !tokens.is_empty() {
        engine.decode(&tokens)?;
        prompt_tokens += tokens.len() as u32;
    }
    Ok((prompt_tokens, prompt_tokens as i32))
}

fn decode_loop(
    engine: &mut dyn Engine,
    info: &ModelInfo,
    chain: &mut SamplerChain,
    request: &GenerateRequest,
    emit: &mut dyn FnMut(GenerateEvent) -> bool,
    prompt_tokens: u32,
    mut n_past: i32,
) -> Result<GenerationResult> {
    let n_ctx = info.n_ctx as i32;
    let mut completion_tokens = 0u32;
    let mut text = String::new();

    let finish_reason = loop {
        // Cancellation is re-checked at every iteration boundary: an
        // abort after token K yields exactly K emitted tokens.
        if request.abort.as_ref().is_some_and(|a| a.is_aborted()) {
            break FinishReason::Aborted;
        }
        if completion_tokens >= request.max_tokens {
            break FinishReason::Length;
        }

        let logits = engine.logits().map_err(|e| with_partial(e, &text))?;
        let token = chain.sample(&logits, &*engine)?;
        chain.accept(token, &*engine)?;
        completion_tokens += 1;

        if engine.is_eog(token) {
            break FinishReason::Stop;
        }

        let piece = engine.token_piece(token);
        text.push_str(&piece);

        if let Some(word) = request
            .stop_words
            .iter()
            .find(|w| text.ends_with(w.as_str()))
        {
            break FinishReason::StopWord(word.clone());
        }

        if !emit(GenerateEvent::Token(piece)) {
            debug!("generation cancelled (receiver dropped)");
            break FinishReason::Aborted;
        }

        if n_past >= n_ctx {
            break FinishReason::Length;
        }

        if let Err(e) = engine.decode(&[token]) {
            let err = with_partial(e, &text);
            let _ = emit(GenerateEvent::Error(err.to_string()));
            return Err(err);
        }
        n_past += 1;
    };

    let _ = emit(GenerateEvent::Done {
        finish_reason: finish_reason.clone(),
        prompt_tokens,
        completion_tokens,
    });
    Ok(GenerationResult {
        text,
        prompt_tokens,
        completion_tokens,
        finish_reason,
    })
}
