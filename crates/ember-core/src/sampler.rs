//! Sampler chain construction and token sampling.
//!
//! An ordered pipeline of selection stages applied to the engine's logits.
//! Stages narrow or reweight a candidate distribution; the chain performs
//! the final draw from whatever survives. Stateful stages (penalties,
//! mirostat, grammar) are kept consistent through [`SamplerChain::accept`],
//! which must be called for every emitted token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use ember_engine::{Token, TokenView};

use crate::error::{Result, SessionError};
use crate::grammar::{CompiledGrammar, GrammarActivation, GrammarMatcher};

//  Candidates

/// One token in the working distribution.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub token: Token,
    pub logit: f32,
    pub p: f32,
}

/// Mutable candidate distribution threaded through the stages.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    items: Vec<Candidate>,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        Self {
            items: logits
                .iter()
                .enumerate()
                .map(|(i, &logit)| Candidate {
                    token: i as Token,
                    logit,
                    p: 0.0,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Populate `p` from the current logits (numerically stable).
    fn softmax(&mut self) {
        let max = self
            .items
            .iter()
            .map(|c| c.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for c in &mut self.items {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.items {
                c.p /= sum;
            }
        }
    }

    /// Sort by logit descending, ties broken by lowest token id.
    fn sort_by_logit(&mut self) {
        self.items.sort_by(|a, b| {
            b.logit
                .partial_cmp(&a.logit)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.token.cmp(&b.token))
        });
    }
}

//  Stages

/// One step in a sampling pipeline.
///
/// Use the validated constructors; an invalid stage never enters a chain
/// ([`SamplerChain::push`] re-validates as a second line of defense).
#[derive(Debug, Clone)]
pub enum SamplerStage {
    TopK { k: i32 },
    TopP { p: f32, min_keep: usize },
    MinP { p: f32, min_keep: usize },
    Typical { p: f32, min_keep: usize },
    Temperature { t: f32 },
    TemperatureExt { t: f32, delta: f32, exponent: f32 },
    Penalties { last_n: i32, repeat: f32, freq: f32, presence: f32 },
    Mirostat { tau: f32, eta: f32, m: usize },
    MirostatV2 { tau: f32, eta: f32 },
    Grammar(Arc<CompiledGrammar>),
}

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::InvalidParam(msg.into())
}

impl SamplerStage {
    pub fn top_k(k: i32) -> Result<Self> {
        let s = Self::TopK { k };
        s.validate()?;
        Ok(s)
    }

    pub fn top_p(p: f32, min_keep: usize) -> Result<Self> {
        let s = Self::TopP { p, min_keep };
        s.validate()?;
        Ok(s)
    }

    pub fn min_p(p: f32, min_keep: usize) -> Result<Self> {
        let s = Self::MinP { p, min_keep };
        s.validate()?;
        Ok(s)
    }

    pub fn typical(p: f32, min_keep: usize) -> Result<Self> {
        let s = Self::Typical { p, min_keep };
        s.validate()?;
        Ok(s)
    }

    pub fn temperature(t: f32) -> Result<Self> {
        let s = Self::Temperature { t };
        s.validate()?;
        Ok(s)
    }

    pub fn temperature_ext(t: f32, delta: f32, exponent: f32) -> Result<Self> {
        let s = Self::TemperatureExt { t, delta, exponent };
        s.validate()?;
        Ok(s)
    }

    pub fn penalties(last_n: i32, repeat: f32, freq: f32, presence: f32) -> Result<Self> {
        let s = Self::Penalties {
            last_n,
            repeat,
            freq,
            presence,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn mirostat(tau: f32, eta: f32, m: usize) -> Result<Self> {
        let s = Self::Mirostat { tau, eta, m };
        s.validate()?;
        Ok(s)
    }

    pub fn mirostat_v2(tau: f32, eta: f32) -> Result<Self> {
        let s = Self::MirostatV2 { tau, eta };
        s.validate()?;
        Ok(s)
    }

    pub fn grammar(grammar: Arc<CompiledGrammar>) -> Self {
        Self::Grammar(grammar)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::TopK { k } if *k <= 0 => Err(invalid(format!("top-k requires k > 0, got {k}"))),
            Self::TopP { p, min_keep } | Self::MinP { p, min_keep } => {
                if !(0.0..=1.0).contains(p) || !p.is_finite() {
                    Err(invalid(format!("p must be in [0, 1], got {p}")))
                } else if *min_keep == 0 {
                    Err(invalid("min_keep must be at least 1"))
                } else {
                    Ok(())
                }
            }
            Self::Typical { p, min_keep } => {
                if !(*p > 0.0 && *p <= 1.0) {
                    Err(invalid(format!("typical p must be in (0, 1], got {p}")))
                } else if *min_keep == 0 {
                    Err(invalid("min_keep must be at least 1"))
                } else {
                    Ok(())
                }
            }
            Self::Temperature { t } | Self::TemperatureExt { t, .. } => {
                if !t.is_finite() || *t < 0.0 {
                    Err(invalid(format!("temperature must be >= 0, got {t}")))
                } else {
                    Ok(())
                }
            }
            Self::Penalties { last_n, repeat, .. } => {
                if *last_n < 0 {
                    Err(invalid(format!("last_n must be >= 0, got {last_n}")))
                } else if *repeat <= 0.0 {
                    Err(invalid(format!("repeat penalty must be > 0, got {repeat}")))
                } else {
                    Ok(())
                }
            }
            Self::Mirostat { tau, eta, m } => {
                if *tau <= 0.0 || *eta <= 0.0 || *m == 0 {
                    Err(invalid("mirostat requires tau > 0, eta > 0 and m > 0"))
                } else {
                    Ok(())
                }
            }
            Self::MirostatV2 { tau, eta } => {
                if *tau <= 0.0 || *eta <= 0.0 {
                    Err(invalid("mirostat requires tau > 0 and eta > 0"))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Stages that can eliminate candidates outright. A grammar stage must
    /// run before any of these (see [`SamplerChain::push`]).
    fn is_narrowing(&self) -> bool {
        matches!(
            self,
            Self::TopK { .. }
                | Self::TopP { .. }
                | Self::MinP { .. }
                | Self::Typical { .. }
                | Self::Mirostat { .. }
                | Self::MirostatV2 { .. }
        )
    }
}

//  Stage runtime state

struct PenaltyState {
    recent: VecDeque<Token>,
}

struct MirostatState {
    mu: f32,
    /// Probabilities of the distribution the last draw was made from,
    /// needed for the surprise observation at accept time.
    last: Vec<(Token, f32)>,
}

struct GrammarRuntime {
    matcher: GrammarMatcher,
    _activation: GrammarActivation,
}

enum StageState {
    Stateless,
    Penalties(PenaltyState),
    Mirostat(MirostatState),
    Grammar(GrammarRuntime),
}

struct Slot {
    stage: SamplerStage,
    state: StageState,
}

//  Chain

/// Ordered, mutable pipeline of [`SamplerStage`]s.
pub struct SamplerChain {
    slots: Vec<Slot>,
    seed: Option<u64>,
    rng: Option<StdRng>,
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerChain {
    /// Create an empty chain. With no stages, [`sample`](Self::sample)
    /// degenerates to pure distribution sampling.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            seed: None,
            rng: None,
        }
    }

    /// Like [`new`](Self::new) with a fixed seed for reproducible draws.
    pub fn with_seed(seed: Option<u64>) -> Self {
        Self {
            slots: Vec::new(),
            seed,
            rng: None,
        }
    }

    /// Append a stage. Fails fast on invalid parameters, on a second
    /// grammar stage, and on a grammar stage placed after a narrowing
    /// stage — probability narrowing ahead of the grammar could eliminate
    /// the only grammar-valid token.
    pub fn push(&mut self, stage: SamplerStage) -> Result<()> {
        stage.validate()?;
        let state = match &stage {
            SamplerStage::Grammar(grammar) => {
                if self.slots.iter().any(|s| matches!(s.stage, SamplerStage::Grammar(_))) {
                    return Err(invalid("chain already contains a grammar stage"));
                }
                if self.slots.iter().any(|s| s.stage.is_narrowing()) {
                    return Err(invalid(
                        "grammar stage must be installed before any narrowing stage",
                    ));
                }
                StageState::Grammar(GrammarRuntime {
                    matcher: grammar.matcher(),
                    _activation: grammar.activate()?,
                })
            }
            SamplerStage::Penalties { .. } => StageState::Penalties(PenaltyState {
                recent: VecDeque::new(),
            }),
            SamplerStage::Mirostat { tau, .. } | SamplerStage::MirostatV2 { tau, .. } => {
                StageState::Mirostat(MirostatState {
                    mu: 2.0 * tau,
                    last: Vec::new(),
                })
            }
            _ => StageState::Stateless,
        };
        self.slots.push(Slot { stage, state });
        Ok(())
    }

    /// Remove and return the stage at `index`.
    pub fn remove_at(&mut self, index: usize) -> Result<SamplerStage> {
        if index >= self.slots.len() {
            return Err(invalid(format!(
                "stage index {index} out of range (len {})",
                self.slots.len()
            )));
        }
        Ok(self.slots.remove(index).stage)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stage_at(&self, index: usize) -> Option<&SamplerStage> {
        self.slots.get(index).map(|s| &s.stage)
    }

    /// Restore every stateful stage (and the RNG) to its initial state.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            match (&slot.stage, &mut slot.state) {
                (_, StageState::Penalties(st)) => st.recent.clear(),
                (
                    SamplerStage::Mirostat { tau, .. } | SamplerStage::MirostatV2 { tau, .. },
                    StageState::Mirostat(st),
                ) => {
                    st.mu = 2.0 * tau;
                    st.last.clear();
                }
                (_, StageState::Grammar(rt)) => rt.matcher.reset(),
                _ => {}
            }
        }
        self.rng = None;
    }

    /// Run the pipeline over `logits` and draw the next token.
    ///
    /// Greedy (highest score, ties to the lowest token id) when the chain
    /// carries a zero temperature; otherwise a seeded softmax draw.
    pub fn sample<V: TokenView + ?Sized>(&mut self, logits: &[f32], vocab: &V) -> Result<Token> {
        if logits.is_empty() {
            return Err(invalid("empty logits"));
        }
        let mut candidates = Candidates::from_logits(logits);
        let mut greedy = false;
        let mut has_grammar = false;

        for slot in &mut self.slots {
            match &slot.stage {
                SamplerStage::TopK { k } => apply_top_k(&mut candidates, *k as usize),
                SamplerStage::TopP { p, min_keep } => apply_top_p(&mut candidates, *p, *min_keep),
                SamplerStage::MinP { p, min_keep } => apply_min_p(&mut candidates, *p, *min_keep),
                SamplerStage::Typical { p, min_keep } => {
                    apply_typical(&mut candidates, *p, *min_keep)
                }
                SamplerStage::Temperature { t } => {
                    if *t == 0.0 {
                        greedy = true;
                    } else {
                        apply_temperature(&mut candidates, *t);
                    }
                }
                SamplerStage::TemperatureExt { t, delta, exponent } => {
                    if *t == 0.0 {
                        greedy = true;
                    } else {
                        apply_temperature_ext(&mut candidates, *t, *delta, *exponent);
                    }
                }
                SamplerStage::Penalties {
                    repeat,
                    freq,
                    presence,
                    ..
                } => {
                    if let StageState::Penalties(st) = &slot.state {
                        apply_penalties(&mut candidates, st, *repeat, *freq, *presence);
                    }
                }
                SamplerStage::Mirostat { m, .. } => {
                    if let StageState::Mirostat(st) = &mut slot.state {
                        apply_mirostat(&mut candidates, st, *m, vocab.n_vocab());
                    }
                }
                SamplerStage::MirostatV2 { .. } => {
                    if let StageState::Mirostat(st) = &mut slot.state {
                        apply_mirostat_v2(&mut candidates, st);
                    }
                }
                SamplerStage::Grammar(_) => {
                    has_grammar = true;
                    if let StageState::Grammar(rt) = &slot.state {
                        apply_grammar(&mut candidates, rt, vocab);
                    }
                }
            }
        }

        if candidates.is_empty() {
            return if has_grammar {
                Err(SessionError::Grammar(
                    "no candidate token satisfies the grammar".into(),
                ))
            } else {
                Err(invalid("all candidates were filtered out"))
            };
        }

        if greedy {
            let mut best = candidates.items[0];
            for c in &candidates.items[1..] {
                if c.logit > best.logit || (c.logit == best.logit && c.token < best.token) {
                    best = *c;
                }
            }
            return Ok(best.token);
        }

        candidates.softmax();
        let rng = self.rng.get_or_insert_with(|| match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        });
        let x: f32 = rng.r#gen();
        let mut cum = 0.0;
        for c in &candidates.items {
            cum += c.p;
            if x <= cum {
                return Ok(c.token);
            }
        }
        Ok(candidates.items[candidates.items.len() - 1].token)
    }

    /// Commit `token` into every stateful stage. Must be called once per
    /// emitted token, before the next [`sample`](Self::sample).
    pub fn accept<V: TokenView + ?Sized>(&mut self, token: Token, vocab: &V) -> Result<()> {
        for slot in &mut self.slots {
            match (&slot.stage, &mut slot.state) {
                (SamplerStage::Penalties { last_n, .. }, StageState::Penalties(st)) => {
                    st.recent.push_back(token);
                    while st.recent.len() > *last_n as usize {
                        st.recent.pop_front();
                    }
                }
                (
                    SamplerStage::Mirostat { tau, eta, .. }
                    | SamplerStage::MirostatV2 { tau, eta },
                    StageState::Mirostat(st),
                ) => {
                    if let Some(&(_, p)) = st.last.iter().find(|(t, _)| *t == token) {
                        if p > 0.0 {
                            let surprise = -p.log2();
                            st.mu -= eta * (surprise - tau);
                        }
                    }
                    st.last.clear();
                }
                (SamplerStage::Grammar(_), StageState::Grammar(rt)) => {
                    if !vocab.is_eog(token) {
                        rt.matcher.advance_text(&vocab.token_piece(token))?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

//  Stage application

fn apply_top_k(c: &mut Candidates, k: usize) {
    c.sort_by_logit();
    c.items.truncate(k.max(1));
}

fn apply_top_p(c: &mut Candidates, p: f32, min_keep: usize) {
    c.softmax();
    c.sort_by_logit();
    let mut cum = 0.0;
    let mut keep = c.items.len();
    for (i, cand) in c.items.iter().enumerate() {
        cum += cand.p;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    c.items.truncate(keep.max(min_keep));
}

fn apply_min_p(c: &mut Candidates, p: f32, min_keep: usize) {
    c.softmax();
    c.sort_by_logit();
    let max_p = c.items.first().map(|c| c.p).unwrap_or(0.0);
    let threshold = max_p * p;
    let keep = c.items.iter().take_while(|c| c.p >= threshold).count();
    c.items.truncate(keep.max(min_keep).max(1));
}

fn apply_typical(c: &mut Candidates, p: f32, min_keep: usize) {
    c.softmax();
    let entropy: f32 = c
        .items
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();
    // Order by closeness to the expected surprise.
    c.items.sort_by(|a, b| {
        let da = (-a.p.max(f32::MIN_POSITIVE).ln() - entropy).abs();
        let db = (-b.p.max(f32::MIN_POSITIVE).ln() - entropy).abs();
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.token.cmp(&b.token))
    });
    let mut cum = 0.0;
    let mut keep = c.items.len();
    for (i, cand) in c.items.iter().enumerate() {
        cum += cand.p;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    c.items.truncate(keep.max(min_keep));
}

fn apply_temperature(c: &mut Candidates, t: f32) {
    for cand in &mut c.items {
        cand.logit /= t;
    }
}

fn apply_temperature_ext(c: &mut Candidates, t: f32, delta: f32, exponent: f32) {
    if delta <= 0.0 {
        apply_temperature(c, t);
        return;
    }
    c.softmax();
    let entropy: f32 = c
        .items
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();
    let max_entropy = (c.items.len() as f32).ln();
    let normalized = if max_entropy > 0.0 {
        entropy / max_entropy
    } else {
        0.0
    };
    let min_t = (t - delta).max(0.0);
    let max_t = t + delta;
    let dyn_t = min_t + (max_t - min_t) * normalized.powf(exponent);
    apply_temperature(c, dyn_t.max(f32::MIN_POSITIVE));
}

fn apply_penalties(c: &mut Candidates, st: &PenaltyState, repeat: f32, freq: f32, presence: f32) {
    if st.recent.is_empty() {
        return;
    }
    let mut counts: HashMap<Token, u32> = HashMap::new();
    for &t in &st.recent {
        *counts.entry(t).or_default() += 1;
    }
    for cand in &mut c.items {
        if let Some(&count) = counts.get(&cand.token) {
            if cand.logit <= 0.0 {
                cand.logit *= repeat;
            } else {
                cand.logit /= repeat;
            }
            cand.logit -= freq * count as f32 + presence;
        }
    }
}

fn apply_mirostat(c: &mut Candidates, st: &mut MirostatState, m: usize, n_vocab: usize) {
    c.softmax();
    c.sort_by_logit();
    let n = c.items.len();
    if n > 1 {
        // Estimate the Zipf exponent from the top of the distribution.
        let mut sum_ti_bi = 0.0;
        let mut sum_ti_sq = 0.0;
        for i in 0..m.saturating_sub(1).min(n - 1) {
            let t_i = ((i as f32 + 2.0) / (i as f32 + 1.0)).ln();
            let b_i = (c.items[i].p / c.items[i + 1].p.max(f32::MIN_POSITIVE)).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        if sum_ti_sq > 0.0 {
            let s_hat = sum_ti_bi / sum_ti_sq;
            let eps = s_hat - 1.0;
            if eps.abs() > f32::EPSILON {
                let k = ((eps * 2f32.powf(st.mu))
                    / (1.0 - (n_vocab.max(2) as f32).powf(-eps)))
                .powf(1.0 / s_hat);
                let k = (k.round() as usize).clamp(1, n);
                c.items.truncate(k);
            }
        }
    }
    c.softmax();
    st.last = c.items.iter().map(|c| (c.token, c.p)).collect();
}

fn apply_mirostat_v2(c: &mut Candidates, st: &mut MirostatState) {
    c.softmax();
    c.sort_by_logit();
    // Drop candidates whose surprise exceeds mu.
    let keep = c
        .items
        .iter()
        .take_while(|cand| cand.p > 0.0 && -cand.p.log2() <= st.mu)
        .count();
    c.items.truncate(keep.max(1));
    c.softmax();
    st.last = c.items.iter().map(|c| (c.token, c.p)).collect();
}

fn apply_grammar<V: TokenView + ?Sized>(c: &mut Candidates, rt: &GrammarRuntime, vocab: &V) {
    c.items.retain(|cand| {
        if vocab.is_eog(cand.token) {
            rt.matcher.can_terminate()
        } else {
            rt.matcher.allows_text(&vocab.token_piece(cand.token))
        }
    });
}

//  High-level SamplingParams

/// Mirostat selection in [`SamplingParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

/// User-facing sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temp")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_typical_p")]
    pub typical_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    #[serde(default)]
    pub mirostat: MirostatMode,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temp() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_min_p() -> f32 {
    0.05
}
fn default_typical_p() -> f32 {
    1.0
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_repeat_last_n() -> i32 {
    64
}
fn default_mirostat_tau() -> f32 {
    5.0
}
fn default_mirostat_eta() -> f32 {
    0.1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temp(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            typical_p: default_typical_p(),
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repeat_last_n: default_repeat_last_n(),
            mirostat: MirostatMode::Off,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            seed: None,
        }
    }
}

/// Greedy decoding: `temperature = 0` with truncation stages disabled.
impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            repeat_penalty: 1.0,
            ..Self::default()
        }
    }

    /// Build a ready-to-use [`SamplerChain`] in canonical order:
    /// grammar → penalties → top-k → top-p → min-p → typical → temperature
    /// (mirostat, when selected, replaces the truncation stages).
    pub fn build_chain(&self, grammar: Option<Arc<CompiledGrammar>>) -> Result<SamplerChain> {
        let mut chain = SamplerChain::with_seed(self.seed);

        if let Some(g) = grammar {
            chain.push(SamplerStage::grammar(g))?;
        }

        if self.repeat_penalty != 1.0
            || self.frequency_penalty != 0.0
            || self.presence_penalty != 0.0
        {
            chain.push(SamplerStage::penalties(
                self.repeat_last_n,
                self.repeat_penalty,
                self.frequency_penalty,
                self.presence_penalty,
            )?)?;
        }

        match self.mirostat {
            MirostatMode::Off => {
                if self.top_k > 0 {
                    chain.push(SamplerStage::top_k(self.top_k)?)?;
                }
                if self.top_p < 1.0 {
                    chain.push(SamplerStage::top_p(self.top_p, 1)?)?;
                }
                if self.min_p > 0.0 {
                    chain.push(SamplerStage::min_p(self.min_p, 1)?)?;
                }
                if self.typical_p < 1.0 {
                    chain.push(SamplerStage::typical(self.typical_p, 1)?)?;
                }
                chain.push(SamplerStage::temperature(self.temperature)?)?;
            }
            MirostatMode::V1 => {
                chain.push(SamplerStage::temperature(self.temperature)?)?;
                chain.push(SamplerStage::mirostat(
                    self.mirostat_tau,
                    self.mirostat_eta,
                    100,
                )?)?;
            }
            MirostatMode::V2 => {
                chain.push(SamplerStage::temperature(self.temperature)?)?;
                chain.push(SamplerStage::mirostat_v2(
                    self.mirostat_tau,
                    self.mirostat_eta,
                )?)?;
            }
        }

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar;

    struct TestVocab {
        pieces: Vec<&'static str>,
        eog: Token,
    }

    impl TokenView for TestVocab {
        fn n_vocab(&self) -> usize {
            self.pieces.len()
        }
        fn token_piece(&self, token: Token) -> String {
            self.pieces
                .get(token as usize)
                .copied()
                .unwrap_or("")
                .to_string()
        }
        fn is_eog(&self, token: Token) -> bool {
            token == self.eog
        }
    }

    fn vocab() -> TestVocab {
        TestVocab {
            pieces: vec!["a", "b", "c", ""],
            eog: 3,
        }
    }

    #[test]
    fn constructors_validate_ranges() {
        assert!(SamplerStage::top_k(0).is_err());
        assert!(SamplerStage::top_p(1.5, 1).is_err());
        assert!(SamplerStage::top_p(0.9, 0).is_err());
        assert!(SamplerStage::min_p(-0.1, 1).is_err());
        assert!(SamplerStage::temperature(-1.0).is_err());
        assert!(SamplerStage::temperature(0.0).is_ok());
        assert!(SamplerStage::penalties(64, 0.0, 0.0, 0.0).is_err());
        assert!(SamplerStage::mirostat(5.0, 0.1, 0).is_err());
    }

    #[test]
    fn greedy_breaks_ties_toward_lowest_token_id() {
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::temperature(0.0).unwrap()).unwrap();
        let v = vocab();
        // Tokens 1 and 2 tie for the max.
        let token = chain.sample(&[1.0, 3.0, 3.0, 0.5], &v).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let v = vocab();
        let logits = [0.3, 1.2, 0.9, 0.1];
        let run = |seed| {
            let mut chain = SamplerChain::with_seed(Some(seed));
            chain.push(SamplerStage::temperature(0.7).unwrap()).unwrap();
            (0..16)
                .map(|_| chain.sample(&logits, &v).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn penalties_demote_recent_tokens() {
        let v = vocab();
        let mut chain = SamplerChain::new();
        chain
            .push(SamplerStage::penalties(8, 1.5, 0.2, 0.2).unwrap())
            .unwrap();
        chain.push(SamplerStage::temperature(0.0).unwrap()).unwrap();

        // Token 1 wins on raw logits…
        let logits = [2.0, 2.1, 1.0, 0.0];
        assert_eq!(chain.sample(&logits, &v).unwrap(), 1);
        // …but loses after it has been emitted.
        chain.accept(1, &v).unwrap();
        assert_eq!(chain.sample(&logits, &v).unwrap(), 0);
        // reset() clears the window.
        chain.reset();
        assert_eq!(chain.sample(&logits, &v).unwrap(), 1);
    }

    #[test]
    fn grammar_after_narrowing_stage_is_rejected() {
        let g = grammar::parse("root ::= \"ab\"\n", "root").unwrap();
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::top_k(5).unwrap()).unwrap();
        let err = chain.push(SamplerStage::grammar(g));
        assert!(matches!(err, Err(SessionError::InvalidParam(_))));
    }

    #[test]
    fn grammar_first_then_narrowing_is_fine() {
        let g = grammar::parse("root ::= \"ab\"\n", "root").unwrap();
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::grammar(g)).unwrap();
        chain.push(SamplerStage::top_k(5).unwrap()).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn second_grammar_stage_is_rejected() {
        let g1 = grammar::parse("root ::= \"a\"\n", "root").unwrap();
        let g2 = grammar::parse("root ::= \"b\"\n", "root").unwrap();
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::grammar(g1)).unwrap();
        assert!(chain.push(SamplerStage::grammar(g2)).is_err());
    }

    #[test]
    fn grammar_masks_invalid_tokens_and_gates_eog() {
        let g = grammar::parse("root ::= \"ab\"\n", "root").unwrap();
        let v = vocab();
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::grammar(g)).unwrap();
        chain.push(SamplerStage::temperature(0.0).unwrap()).unwrap();

        // "b" has the best logit but only "a" is grammar-valid here.
        let logits = [1.0, 5.0, 4.0, 4.5];
        assert_eq!(chain.sample(&logits, &v).unwrap(), 0);
        chain.accept(0, &v).unwrap();

        // Next position: only "b".
        assert_eq!(chain.sample(&logits, &v).unwrap(), 1);
        chain.accept(1, &v).unwrap();

        // Grammar satisfied: only end-of-generation remains admissible.
        assert_eq!(chain.sample(&logits, &v).unwrap(), 3);
    }

    #[test]
    fn dead_end_reports_grammar_violation_not_a_crash() {
        // Grammar wants "ab"; the vocabulary can only produce "c" after "a".
        let g = grammar::parse("root ::= \"ac\"\n", "root").unwrap();
        let v = vocab();
        let mut chain = SamplerChain::new();
        chain.push(SamplerStage::grammar(g)).unwrap();
        chain.push(SamplerStage::temperature(0.0).unwrap()).unwrap();

        assert_eq!(chain.sample(&[1.0, 1.0, 1.0, 1.0], &v).unwrap(), 0);
        chain.accept(0, &v).unwrap();
        // Force a token the grammar rejects through accept: the error is a
        // Grammar error, not a panic.
        let err = chain.accept(1, &v);
        assert!(matches!(err, Err(SessionError::Grammar(_))));
    }

    #[test]
    fn empty_chain_is_pure_distribution_sampling() {
        let v = vocab();
        let mut chain = SamplerChain::with_seed(Some(7));
        // Heavily peaked distribution: the draw lands on token 2.
        let token = chain.sample(&[-50.0, -50.0, 50.0, -50.0], &v).unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn top_k_keeps_the_k_best() {
        let mut c = Candidates::from_logits(&[0.1, 5.0, 3.0, 4.0]);
        apply_top_k(&mut c, 2);
        let kept: Vec<Token> = c.items.iter().map(|c| c.token).collect();
        assert_eq!(kept, vec![1, 3]);
    }

    #[test]
    fn min_p_scales_with_the_leader() {
        let mut c = Candidates::from_logits(&[4.0, 4.0, -10.0]);
        apply_min_p(&mut c, 0.5, 1);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn mirostat_v2_state_updates_on_accept() {
        let v = TestVocab {
            pieces: vec!["x"; 8],
            eog: 7,
        };
        let mut chain = SamplerChain::with_seed(Some(3));
        chain
            .push(SamplerStage::mirostat_v2(5.0, 0.1).unwrap())
            .unwrap();
        let logits = [3.0, 2.5, 2.0, 1.5, 1.0, 0.5, 0.0, -1.0];
        let token = chain.sample(&logits, &v).unwrap();
        chain.accept(token, &v).unwrap();
        // Sampling again still works with the adapted mu.
        chain.sample(&logits, &v).unwrap();
    }

    #[test]
    fn params_build_canonical_chain_order() {
        let g = grammar::parse("root ::= [ab]*\n", "root").unwrap();
        let params = SamplingParams::default();
        let chain = params.build_chain(Some(g)).unwrap();
        assert!(matches!(chain.stage_at(0), Some(SamplerStage::Grammar(_))));
        assert!(matches!(
            chain.stage_at(1),
            Some(SamplerStage::Penalties { .. })
        ));
        // Last stage is the temperature.
        assert!(matches!(
            chain.stage_at(chain.len() - 1),
            Some(SamplerStage::Temperature { .. })
        ));
    }

    #[test]
    fn sampling_params_serde_defaults() {
        let p: SamplingParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.temperature, 0.8);
        assert_eq!(p.top_k, 40);
        assert_eq!(p.mirostat, MirostatMode::Off);
    }
}
