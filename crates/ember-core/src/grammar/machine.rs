//! Incremental grammar matching.
//!
//! A [`GrammarMatcher`] simulates the compiled grammar as a set of parallel
//! pushdown stacks, advanced one character at a time. A token piece is
//! admissible when at least one stack survives all of its characters;
//! end-of-generation is admissible only when some stack has fully consumed
//! the root rule.

use std::sync::Arc;

use crate::error::{Result, SessionError};

use super::{CompiledGrammar, Item, LoweredRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    rule: u32,
    alt: u32,
    pos: u32,
}

type Stack = Vec<Frame>;

/// Live parse state over a [`CompiledGrammar`].
pub struct GrammarMatcher {
    grammar: Arc<CompiledGrammar>,
    stacks: Vec<Stack>,
}

impl GrammarMatcher {
    pub(crate) fn new(grammar: Arc<CompiledGrammar>) -> Self {
        let mut stacks = Vec::new();
        for alt in 0..grammar.rules[grammar.root].alts.len() {
            normalize(
                &grammar.rules,
                vec![Frame {
                    rule: grammar.root as u32,
                    alt: alt as u32,
                    pos: 0,
                }],
                &mut stacks,
            );
        }
        Self { grammar, stacks }
    }

    /// Restore the initial parse state.
    pub fn reset(&mut self) {
        *self = Self::new(Arc::clone(&self.grammar));
    }

    /// True when the grammar has been fully satisfied at this point.
    pub fn can_terminate(&self) -> bool {
        self.stacks.iter().any(|s| s.is_empty())
    }

    /// True when no continuation can ever match (dead parse).
    pub fn is_dead(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Would consuming `text` keep at least one parse alive?
    pub fn allows_text(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = advance(&self.grammar.rules, &stacks, c);
            if stacks.is_empty() {
                return false;
            }
        }
        true
    }

    /// Consume `text`, committing the parse state.
    pub fn advance_text(&mut self, text: &str) -> Result<()> {
        for c in text.chars() {
            let next = advance(&self.grammar.rules, &self.stacks, c);
            if next.is_empty() {
                return Err(SessionError::Grammar(format!(
                    "character {c:?} violates the grammar"
                )));
            }
            self.stacks = next;
        }
        Ok(())
    }

    /// Full-match check from the current state; does not commit.
    pub fn accepts(&self, text: &str) -> bool {
        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = advance(&self.grammar.rules, &stacks, c);
            if stacks.is_empty() {
                return false;
            }
        }
        stacks.iter().any(|s| s.is_empty())
    }
}

fn push_unique(out: &mut Vec<Stack>, stack: Stack) {
    if !out.contains(&stack) {
        out.push(stack);
    }
}

/// Resolve a stack until its top frame sits on a character class (ready to
/// consume) or the stack empties (parse complete). Rule references fork
/// into one stack per alternative.
fn normalize(rules: &[LoweredRule], mut stack: Stack, out: &mut Vec<Stack>) {
    loop {
        let Some(&top) = stack.last() else {
            push_unique(out, stack);
            return;
        };
        let alt = &rules[top.rule as usize].alts[top.alt as usize];
        if top.pos as usize == alt.len() {
            // Rule complete: pop and step the parent past its reference.
            stack.pop();
            if let Some(parent) = stack.last_mut() {
                parent.pos += 1;
                continue;
            }
            push_unique(out, stack);
            return;
        }
        match &alt[top.pos as usize] {
            Item::Class(_) => {
                push_unique(out, stack);
                return;
            }
            Item::Ref(r) => {
                for (i, _) in rules[*r].alts.iter().enumerate() {
                    let mut fork = stack.clone();
                    fork.push(Frame {
                        rule: *r as u32,
                        alt: i as u32,
                        pos: 0,
                    });
                    normalize(rules, fork, out);
                }
                return;
            }
        }
    }
}

/// Advance every stack over one character; stacks that cannot consume it
/// are dropped.
fn advance(rules: &[LoweredRule], stacks: &[Stack], c: char) -> Vec<Stack> {
    let mut next = Vec::new();
    for stack in stacks {
        let Some(&top) = stack.last() else {
            // Completed parse cannot consume further input.
            continue;
        };
        let alt = &rules[top.rule as usize].alts[top.alt as usize];
        if let Item::Class(class) = &alt[top.pos as usize] {
            if class.matches(c) {
                let mut stepped = stack.clone();
                if let Some(frame) = stepped.last_mut() {
                    frame.pos += 1;
                }
                normalize(rules, stepped, &mut next);
            }
        }
    }
    next
}
