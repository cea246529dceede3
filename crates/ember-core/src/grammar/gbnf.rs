//! GBNF rule representation, text parser, and renderer.
//!
//! The synthesizers build rules directly as this AST and render them to
//! GBNF text; caller-supplied grammars arrive as text and are parsed back
//! into the same AST before compilation.

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repeat {
    One,
    Optional,
    ZeroOrMore,
    OneOrMore,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Term {
    /// Raw characters to match verbatim. Escaping happens at render time.
    Literal(String),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
    Ref(String),
    /// Parenthesized alternation.
    Group(Vec<Sequence>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Symbol {
    pub term: Term,
    pub repeat: Repeat,
}

pub(crate) type Sequence = Vec<Symbol>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawRule {
    pub name: String,
    pub alts: Vec<Sequence>,
}

fn err(msg: impl Into<String>) -> SessionError {
    SessionError::Grammar(msg.into())
}

//  Parsing

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skip spaces, tabs and comments — not newlines (they delimit rules).
    fn skip_inline_ws(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t') => {
                    self.pos += 1;
                }
                Some('#') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Skip all whitespace including newlines, plus comments.
    fn skip_all_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.pos += 1;
                }
                Some('#') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Parse GBNF text into raw rules.
pub(crate) fn parse_rules(text: &str) -> Result<Vec<RawRule>> {
    let mut cur = Cursor {
        chars: text.chars().collect(),
        pos: 0,
    };
    let mut rules: Vec<RawRule> = Vec::new();

    loop {
        cur.skip_all_ws();
        if cur.peek().is_none() {
            break;
        }
        let name = parse_ident(&mut cur)?;
        cur.skip_inline_ws();
        if !(cur.eat(':') && cur.eat(':') && cur.eat('=')) {
            return Err(err(format!("expected '::=' after rule name '{name}'")));
        }
        let alts = parse_alternation(&mut cur, false)?;
        if rules.iter().any(|r| r.name == name) {
            return Err(err(format!("duplicate rule '{name}'")));
        }
        rules.push(RawRule { name, alts });
    }

    if rules.is_empty() {
        return Err(err("grammar contains no rules"));
    }
    Ok(rules)
}

fn parse_ident(cur: &mut Cursor) -> Result<String> {
    let mut name = String::new();
    while let Some(c) = cur.peek() {
        if is_ident_char(c) {
            name.push(c);
            cur.pos += 1;
        } else {
            break;
        }
    }
    if name.is_empty() {
        return Err(err(format!(
            "expected rule name, found {:?}",
            cur.peek().map(String::from).unwrap_or_default()
        )));
    }
    Ok(name)
}

/// Parse alternatives. Inside a group (`nested`) the alternation ends at
/// `)`; at top level it ends at a newline not continued with `|`.
fn parse_alternation(cur: &mut Cursor, nested: bool) -> Result<Vec<Sequence>> {
    let mut alts = Vec::new();
    loop {
        alts.push(parse_sequence(cur, nested)?);
        if nested {
            cur.skip_all_ws();
            if cur.eat('|') {
                continue;
            }
            break;
        }
        // Top level: a newline ends the rule unless the next significant
        // char is a '|' continuation.
        let save = cur.pos;
        cur.skip_all_ws();
        if cur.eat('|') {
            continue;
        }
        cur.pos = save;
        break;
    }
    Ok(alts)
}

fn parse_sequence(cur: &mut Cursor, nested: bool) -> Result<Sequence> {
    let mut seq = Vec::new();
    loop {
        if nested {
            cur.skip_all_ws();
        } else {
            cur.skip_inline_ws();
        }
        let term = match cur.peek() {
            None | Some('\n') => break,
            Some('|') => break,
            Some(')') => {
                if nested {
                    break;
                }
                return Err(err("unbalanced ')'"));
            }
            Some('"') => parse_literal(cur)?,
            Some('[') => parse_class(cur)?,
            Some('(') => {
                cur.bump();
                let alts = parse_alternation(cur, true)?;
                cur.skip_all_ws();
                if !cur.eat(')') {
                    return Err(err("expected ')'"));
                }
                Term::Group(alts)
            }
            Some(c) if is_ident_char(c) => Term::Ref(parse_ident(cur)?),
            Some(c) => return Err(err(format!("unexpected character {c:?}"))),
        };
        let repeat = match cur.peek() {
            Some('?') => {
                cur.bump();
                Repeat::Optional
            }
            Some('*') => {
                cur.bump();
                Repeat::ZeroOrMore
            }
            Some('+') => {
                cur.bump();
                Repeat::OneOrMore
            }
            _ => Repeat::One,
        };
        seq.push(Symbol { term, repeat });
    }
    Ok(seq)
}

fn parse_escape(cur: &mut Cursor) -> Result<char> {
    match cur.bump() {
        Some('n') => Ok('\n'),
        Some('r') => Ok('\r'),
        Some('t') => Ok('\t'),
        Some(c @ ('"' | '\\' | '/' | '[' | ']' | '^' | '-')) => Ok(c),
        Some('u') => {
            let mut v = 0u32;
            for _ in 0..4 {
                let c = cur.bump().ok_or_else(|| err("truncated \\u escape"))?;
                let d = c.to_digit(16).ok_or_else(|| err("invalid \\u escape"))?;
                v = v * 16 + d;
            }
            char::from_u32(v).ok_or_else(|| err("invalid \\u code point"))
        }
        other => Err(err(format!("invalid escape {other:?}"))),
    }
}

fn parse_literal(cur: &mut Cursor) -> Result<Term> {
    cur.bump(); // opening quote
    let mut out = String::new();
    loop {
        match cur.bump() {
            None => return Err(err("unterminated string literal")),
            Some('"') => break,
            Some('\\') => out.push(parse_escape(cur)?),
            Some(c) => out.push(c),
        }
    }
    Ok(Term::Literal(out))
}

fn parse_class(cur: &mut Cursor) -> Result<Term> {
    cur.bump(); // '['
    let negated = cur.eat('^');
    let mut ranges = Vec::new();
    loop {
        let lo = match cur.bump() {
            None => return Err(err("unterminated character class")),
            Some(']') => break,
            Some('\\') => parse_escape(cur)?,
            Some(c) => c,
        };
        let hi = if cur.peek() == Some('-') && cur.chars.get(cur.pos + 1) != Some(&']') {
            cur.bump();
            match cur.bump() {
                None => return Err(err("unterminated character class")),
                Some('\\') => parse_escape(cur)?,
                Some(c) => c,
            }
        } else {
            lo
        };
        if hi < lo {
            return Err(err(format!("inverted range {lo:?}-{hi:?}")));
        }
        ranges.push((lo, hi));
    }
    if ranges.is_empty() && !negated {
        return Err(err("empty character class"));
    }
    Ok(Term::Class { negated, ranges })
}

//  Rendering

fn escape_literal(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}

fn escape_class_char(c: char, out: &mut String) {
    match c {
        ']' | '^' | '-' | '\\' => {
            out.push('\\');
            out.push(c);
        }
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c => out.push(c),
    }
}

fn render_term(term: &Term, out: &mut String) {
    match term {
        Term::Literal(s) => {
            out.push('"');
            escape_literal(s, out);
            out.push('"');
        }
        Term::Class { negated, ranges } => {
            out.push('[');
            if *negated {
                out.push('^');
            }
            for &(lo, hi) in ranges {
                escape_class_char(lo, out);
                if hi != lo {
                    out.push('-');
                    escape_class_char(hi, out);
                }
            }
            out.push(']');
        }
        Term::Ref(name) => out.push_str(name),
        Term::Group(alts) => {
            out.push('(');
            render_alts(alts, out);
            out.push(')');
        }
    }
}

fn render_alts(alts: &[Sequence], out: &mut String) {
    for (i, seq) in alts.iter().enumerate() {
        if i > 0 {
            out.push_str(" | ");
        }
        if seq.is_empty() {
            out.push_str("\"\"");
            continue;
        }
        for (j, sym) in seq.iter().enumerate() {
            if j > 0 {
                out.push(' ');
            }
            render_term(&sym.term, out);
            match sym.repeat {
                Repeat::One => {}
                Repeat::Optional => out.push('?'),
                Repeat::ZeroOrMore => out.push('*'),
                Repeat::OneOrMore => out.push('+'),
            }
        }
    }
}

/// Render rules back to GBNF text.
pub(crate) fn render_rules(rules: &[RawRule]) -> String {
    let mut out = String::new();
    for rule in rules {
        out.push_str(&rule.name);
        out.push_str(" ::= ");
        render_alts(&rule.alts, &mut out);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals_classes_and_refs() {
        let rules = parse_rules("root ::= \"yes\" | \"no\" tail\ntail ::= [a-z0-9]+\n").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].alts.len(), 2);
        assert_eq!(
            rules[0].alts[0][0].term,
            Term::Literal("yes".to_string())
        );
        assert_eq!(rules[1].alts[0][0].repeat, Repeat::OneOrMore);
    }

    #[test]
    fn parses_groups_and_negated_classes() {
        let rules = parse_rules("s ::= \"\\\"\" ( [^\"\\\\] | \"\\\\\" [\"nrt] )* \"\\\"\"\n").unwrap();
        let seq = &rules[0].alts[0];
        assert_eq!(seq.len(), 3);
        assert!(matches!(seq[1].term, Term::Group(_)));
        assert_eq!(seq[1].repeat, Repeat::ZeroOrMore);
    }

    #[test]
    fn continuation_lines_extend_the_same_rule() {
        let text = "root ::= \"a\"\n       | \"b\"\nnext ::= \"c\"\n";
        let rules = parse_rules(text).unwrap();
        assert_eq!(rules[0].alts.len(), 2);
        assert_eq!(rules[1].name, "next");
    }

    #[test]
    fn render_parse_round_trip() {
        let text = "root ::= \"hi \\\"there\\\"\" [a-zA-Z]* (sub | \"x\")?\nsub ::= [^0-9]+\n";
        let rules = parse_rules(text).unwrap();
        let rendered = render_rules(&rules);
        let reparsed = parse_rules(&rendered).unwrap();
        assert_eq!(rules, reparsed);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_rules("root = \"a\"").is_err());
        assert!(parse_rules("root ::= \"unterminated").is_err());
        assert!(parse_rules("root ::= [z-a]").is_err());
        assert!(parse_rules("root ::= \"a\"\nroot ::= \"b\"").is_err());
    }
}
