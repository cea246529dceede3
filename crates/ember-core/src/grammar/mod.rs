//! Grammar synthesis and constrained-decoding support.
//!
//! Two high-level intents — a JSON Schema or a tool-call specification —
//! compile into a formal GBNF grammar ([`CompiledGrammar`]); raw GBNF text
//! is also accepted. The compiled form doubles as the state machine the
//! grammar sampler stage drives during decode ([`GrammarMatcher`]).

mod gbnf;
mod machine;
mod synth;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, SessionError};
use gbnf::{RawRule, Repeat, Sequence, Term};

pub use machine::GrammarMatcher;
pub use synth::{SchemaOptions, ToolSpec, from_json_schema, from_tool_specs};

//  Lowered form

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CharClass {
    pub negated: bool,
    pub ranges: Vec<(char, char)>,
}

impl CharClass {
    pub fn matches(&self, c: char) -> bool {
        let inside = self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        inside != self.negated
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Item {
    Class(CharClass),
    Ref(usize),
}

/// A rule after desugaring: alternatives of plain class/ref sequences.
/// Repetition becomes auxiliary rules, literals become char runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoweredRule {
    pub alts: Vec<Vec<Item>>,
}

//  CompiledGrammar

/// An immutable compiled constraint, shareable across chains.
///
/// May be installed into multiple chains sequentially, but only one chain
/// may hold it as an active stage at a time — two live parse states over
/// the same grammar object would disagree mid-decode.
pub struct CompiledGrammar {
    root_name: String,
    text: String,
    degraded: Vec<String>,
    pub(crate) root: usize,
    pub(crate) rules: Vec<LoweredRule>,
    active: AtomicBool,
}

impl fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGrammar")
            .field("root", &self.root_name)
            .field("rules", &self.rules.len())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl CompiledGrammar {
    /// Root rule name.
    pub fn root(&self) -> &str {
        &self.root_name
    }

    /// Rendered GBNF text, as handed to the engine.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Schema constructs that were degraded to a weaker production during
    /// synthesis. Empty for fully-expressed grammars.
    pub fn degraded(&self) -> &[String] {
        &self.degraded
    }

    /// Fresh matcher positioned at the root rule.
    pub fn matcher(self: &Arc<Self>) -> GrammarMatcher {
        GrammarMatcher::new(Arc::clone(self))
    }

    /// Claim this grammar for a chain. Fails while another chain holds it.
    pub(crate) fn activate(self: &Arc<Self>) -> Result<GrammarActivation> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::Grammar(
                "grammar is already installed in an active chain".into(),
            ));
        }
        Ok(GrammarActivation {
            grammar: Arc::clone(self),
        })
    }

    pub(crate) fn compile(
        root_name: &str,
        raw: Vec<RawRule>,
        degraded: Vec<String>,
    ) -> Result<Arc<Self>> {
        let text = gbnf::render_rules(&raw);
        let (root, rules) = lower(root_name, &raw)?;
        check_left_recursion(&rules)?;
        tracing::debug!(root = root_name, rules = rules.len(), "grammar compiled");
        Ok(Arc::new(Self {
            root_name: root_name.to_string(),
            text,
            degraded,
            root,
            rules,
            active: AtomicBool::new(false),
        }))
    }
}

/// Parse caller-supplied GBNF text into a compiled grammar.
pub fn parse(text: &str, root: &str) -> Result<Arc<CompiledGrammar>> {
    let raw = gbnf::parse_rules(text)?;
    CompiledGrammar::compile(root, raw, Vec::new())
}

/// Exclusive-use token for a grammar installed as a chain stage.
pub(crate) struct GrammarActivation {
    grammar: Arc<CompiledGrammar>,
}

impl Drop for GrammarActivation {
    fn drop(&mut self) {
        self.grammar.active.store(false, Ordering::SeqCst);
    }
}

//  Lowering

struct Lowerer<'a> {
    names: Vec<&'a str>,
    rules: Vec<LoweredRule>,
}

impl<'a> Lowerer<'a> {
    fn resolve(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| *n == name)
            .ok_or_else(|| SessionError::Grammar(format!("reference to undefined rule '{name}'")))
    }

    fn aux(&mut self, alts: Vec<Vec<Item>>) -> usize {
        let idx = self.rules.len();
        self.names.push("");
        self.rules.push(LoweredRule { alts });
        idx
    }

    fn lower_term(&mut self, term: &Term) -> Result<Vec<Item>> {
        Ok(match term {
            Term::Literal(s) => s
                .chars()
                .map(|c| {
                    Item::Class(CharClass {
                        negated: false,
                        ranges: vec![(c, c)],
                    })
                })
                .collect(),
            Term::Class { negated, ranges } => vec![Item::Class(CharClass {
                negated: *negated,
                ranges: ranges.clone(),
            })],
            Term::Ref(name) => vec![Item::Ref(self.resolve(name)?)],
            Term::Group(alts) => {
                let lowered = self.lower_alts(alts)?;
                vec![Item::Ref(self.aux(lowered))]
            }
        })
    }

    fn lower_seq(&mut self, seq: &Sequence) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for sym in seq {
            let base = self.lower_term(&sym.term)?;
            match sym.repeat {
                Repeat::One => items.extend(base),
                Repeat::Optional => {
                    let aux = self.aux(vec![base, Vec::new()]);
                    items.push(Item::Ref(aux));
                }
                Repeat::ZeroOrMore => {
                    let aux = self.aux(Vec::new());
                    let mut rec = base.clone();
                    rec.push(Item::Ref(aux));
                    self.rules[aux].alts = vec![rec, Vec::new()];
                    items.push(Item::Ref(aux));
                }
                Repeat::OneOrMore => {
                    let aux = self.aux(Vec::new());
                    let mut rec = base.clone();
                    rec.push(Item::Ref(aux));
                    self.rules[aux].alts = vec![rec, base];
                    items.push(Item::Ref(aux));
                }
            }
        }
        Ok(items)
    }

    fn lower_alts(&mut self, alts: &[Sequence]) -> Result<Vec<Vec<Item>>> {
        alts.iter().map(|seq| self.lower_seq(seq)).collect()
    }
}

fn lower(root_name: &str, raw: &[RawRule]) -> Result<(usize, Vec<LoweredRule>)> {
    let mut lowerer = Lowerer {
        names: raw.iter().map(|r| r.name.as_str()).collect(),
        rules: vec![LoweredRule::default(); raw.len()],
    };
    let root = lowerer.resolve(root_name).map_err(|_| {
        SessionError::Grammar(format!("root rule '{root_name}' is not defined"))
    })?;
    for (i, rule) in raw.iter().enumerate() {
        let alts = lowerer.lower_alts(&rule.alts)?;
        lowerer.rules[i].alts = alts;
    }
    Ok((root, lowerer.rules))
}

//  Left-recursion rejection

fn check_left_recursion(rules: &[LoweredRule]) -> Result<()> {
    // Nullable fixpoint: a rule is nullable if some alternative is all
    // nullable items (classes never are).
    let mut nullable = vec![false; rules.len()];
    loop {
        let mut changed = false;
        for (i, rule) in rules.iter().enumerate() {
            if nullable[i] {
                continue;
            }
            let is_nullable = rule.alts.iter().any(|alt| {
                alt.iter().all(|item| match item {
                    Item::Class(_) => false,
                    Item::Ref(r) => nullable[*r],
                })
            });
            if is_nullable {
                nullable[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Edges to rules reachable in first position (through nullable refs).
    let mut first: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
    for (i, rule) in rules.iter().enumerate() {
        for alt in &rule.alts {
            for item in alt {
                match item {
                    Item::Class(_) => break,
                    Item::Ref(r) => {
                        first[i].push(*r);
                        if !nullable[*r] {
                            break;
                        }
                    }
                }
            }
        }
    }

    // DFS cycle detection.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }
    fn visit(n: usize, first: &[Vec<usize>], marks: &mut [Mark]) -> bool {
        marks[n] = Mark::Grey;
        for &m in &first[n] {
            match marks[m] {
                Mark::Grey => return false,
                Mark::White => {
                    if !visit(m, first, marks) {
                        return false;
                    }
                }
                Mark::Black => {}
            }
        }
        marks[n] = Mark::Black;
        true
    }

    let mut marks = vec![Mark::White; rules.len()];
    for i in 0..rules.len() {
        if marks[i] == Mark::White && !visit(i, &first, &mut marks) {
            return Err(SessionError::Grammar(
                "left-recursive rule set cannot be matched incrementally".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_rejects_undefined_refs_and_missing_root() {
        assert!(matches!(
            parse("root ::= ghost\n", "root"),
            Err(SessionError::Grammar(_))
        ));
        assert!(matches!(
            parse("a ::= \"x\"\n", "root"),
            Err(SessionError::Grammar(_))
        ));
    }

    #[test]
    fn compile_rejects_left_recursion() {
        assert!(matches!(
            parse("root ::= root \"a\" | \"b\"\n", "root"),
            Err(SessionError::Grammar(_))
        ));
        // Indirect, through a nullable prefix.
        let text = "root ::= pad other\npad ::= \"x\"?\nother ::= root\n";
        assert!(matches!(parse(text, "root"), Err(SessionError::Grammar(_))));
    }

    #[test]
    fn activation_is_exclusive_until_dropped() {
        let g = parse("root ::= \"a\"\n", "root").unwrap();
        let guard = g.activate().unwrap();
        assert!(g.activate().is_err());
        drop(guard);
        assert!(g.activate().is_ok());
    }
}
