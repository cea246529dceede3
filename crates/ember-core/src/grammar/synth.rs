//! Grammar synthesis from high-level intents.
//!
//! Compiles a JSON Schema or a tool-call specification into GBNF. Object
//! schemas force every declared property, in declaration order; unsupported
//! constructs degrade to the permissive `value` production unless
//! [`SchemaOptions::strict`] turns the degradation into an error. All
//! embedded literals are escaped, so untrusted schema/tool text cannot
//! inject grammar syntax.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

use super::CompiledGrammar;
use super::gbnf::{RawRule, Repeat, Sequence, Symbol, Term};

/// Policy knobs for schema compilation.
#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    /// Error on constructs the compiler cannot express instead of
    /// silently weakening them to the permissive JSON production.
    pub strict: bool,
}

/// One callable tool, as declared by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments object, when declared.
    #[serde(default)]
    pub parameters: Option<Value>,
}

//  AST construction helpers

fn lit(s: impl Into<String>) -> Symbol {
    Symbol {
        term: Term::Literal(s.into()),
        repeat: Repeat::One,
    }
}

fn rref(name: &str) -> Symbol {
    Symbol {
        term: Term::Ref(name.to_string()),
        repeat: Repeat::One,
    }
}

fn class(ranges: &[(char, char)], repeat: Repeat) -> Symbol {
    Symbol {
        term: Term::Class {
            negated: false,
            ranges: ranges.to_vec(),
        },
        repeat,
    }
}

fn group(alts: Vec<Sequence>, repeat: Repeat) -> Symbol {
    Symbol {
        term: Term::Group(alts),
        repeat,
    }
}

/// `"key"` rendered exactly as it will appear inside the JSON output.
fn json_literal(text: &str) -> Result<String> {
    serde_json::to_string(text).map_err(|e| SessionError::Schema(e.to_string()))
}

/// Rule names may only contain `[a-zA-Z0-9-]` and must start with a letter.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    match out.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => out.insert_str(0, "r-"),
    }
    out
}

//  Rule builder

struct RuleBuilder {
    rules: Vec<RawRule>,
    degraded: Vec<String>,
    strict: bool,
}

impl RuleBuilder {
    fn new(strict: bool) -> Self {
        Self {
            rules: Vec::new(),
            degraded: Vec::new(),
            strict,
        }
    }

    fn has(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r.name == name)
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    /// Add a rule under `name`, uniquifying on collision. Returns the name
    /// actually used.
    fn add(&mut self, name: &str, alts: Vec<Sequence>) -> String {
        let mut unique = name.to_string();
        let mut n = 1;
        while self.has(&unique) {
            n += 1;
            unique = format!("{name}-{n}");
        }
        self.rules.push(RawRule {
            name: unique.clone(),
            alts,
        });
        unique
    }

    /// Reserve `name` with empty alternatives, to be filled later.
    /// Used for the mutually recursive JSON core rules.
    fn declare(&mut self, name: &str) {
        self.rules.push(RawRule {
            name: name.to_string(),
            alts: Vec::new(),
        });
    }

    fn fill(&mut self, name: &str, alts: Vec<Sequence>) {
        if let Some(i) = self.find(name) {
            self.rules[i].alts = alts;
        }
    }

    fn degrade(&mut self, what: String) -> Result<String> {
        if self.strict {
            return Err(SessionError::Schema(format!(
                "unsupported schema construct: {what}"
            )));
        }
        tracing::debug!(construct = %what, "degrading to permissive json production");
        self.degraded.push(what);
        Ok(self.ensure_value())
    }

    fn note(&mut self, what: String) -> Result<()> {
        if self.strict {
            return Err(SessionError::Schema(format!(
                "unsupported schema constraint: {what}"
            )));
        }
        self.degraded.push(what);
        Ok(())
    }

    //  JSON primitive rules

    fn ensure_space(&mut self) -> String {
        if !self.has("space") {
            self.declare("space");
            self.fill(
                "space",
                vec![vec![class(
                    &[(' ', ' '), ('\t', '\t'), ('\n', '\n'), ('\r', '\r')],
                    Repeat::ZeroOrMore,
                )]],
            );
        }
        "space".into()
    }

    fn ensure_string(&mut self) -> String {
        if !self.has("string") {
            self.ensure_space();
            self.declare("string");
            let escape = group(
                vec![
                    vec![class(
                        &[
                            ('"', '"'),
                            ('\\', '\\'),
                            ('/', '/'),
                            ('b', 'b'),
                            ('f', 'f'),
                            ('n', 'n'),
                            ('r', 'r'),
                            ('t', 't'),
                        ],
                        Repeat::One,
                    )],
                    vec![
                        lit("u"),
                        class(&[('0', '9'), ('a', 'f'), ('A', 'F')], Repeat::One),
                        class(&[('0', '9'), ('a', 'f'), ('A', 'F')], Repeat::One),
                        class(&[('0', '9'), ('a', 'f'), ('A', 'F')], Repeat::One),
                        class(&[('0', '9'), ('a', 'f'), ('A', 'F')], Repeat::One),
                    ],
                ],
                Repeat::One,
            );
            let chars = group(
                vec![
                    vec![Symbol {
                        term: Term::Class {
                            negated: true,
                            ranges: vec![('"', '"'), ('\\', '\\')],
                        },
                        repeat: Repeat::One,
                    }],
                    vec![lit("\\"), escape],
                ],
                Repeat::ZeroOrMore,
            );
            self.fill(
                "string",
                vec![vec![lit("\""), chars, lit("\""), rref("space")]],
            );
        }
        "string".into()
    }

    fn int_body(&self) -> Symbol {
        group(
            vec![
                vec![lit("0")],
                vec![
                    class(&[('1', '9')], Repeat::One),
                    class(&[('0', '9')], Repeat::ZeroOrMore),
                ],
            ],
            Repeat::One,
        )
    }

    fn ensure_number(&mut self) -> String {
        if !self.has("number") {
            self.ensure_space();
            self.declare("number");
            let frac = group(
                vec![vec![lit("."), class(&[('0', '9')], Repeat::OneOrMore)]],
                Repeat::Optional,
            );
            let exp = group(
                vec![vec![
                    class(&[('e', 'e'), ('E', 'E')], Repeat::One),
                    group(
                        vec![vec![class(&[('-', '-'), ('+', '+')], Repeat::One)]],
                        Repeat::Optional,
                    ),
                    class(&[('0', '9')], Repeat::OneOrMore),
                ]],
                Repeat::Optional,
            );
            self.fill(
                "number",
                vec![vec![
                    group(vec![vec![lit("-")]], Repeat::Optional),
                    self.int_body(),
                    frac,
                    exp,
                    rref("space"),
                ]],
            );
        }
        "number".into()
    }

    fn ensure_integer(&mut self) -> String {
        if !self.has("integer") {
            self.ensure_space();
            self.declare("integer");
            self.fill(
                "integer",
                vec![vec![
                    group(vec![vec![lit("-")]], Repeat::Optional),
                    self.int_body(),
                    rref("space"),
                ]],
            );
        }
        "integer".into()
    }

    fn ensure_boolean(&mut self) -> String {
        if !self.has("boolean") {
            self.ensure_space();
            self.declare("boolean");
            self.fill(
                "boolean",
                vec![
                    vec![lit("true"), rref("space")],
                    vec![lit("false"), rref("space")],
                ],
            );
        }
        "boolean".into()
    }

    fn ensure_null(&mut self) -> String {
        if !self.has("null") {
            self.ensure_space();
            self.declare("null");
            self.fill("null", vec![vec![lit("null"), rref("space")]]);
        }
        "null".into()
    }

    /// The permissive `value` production and its mutually recursive
    /// `object`/`array`/`member` companions.
    fn ensure_value(&mut self) -> String {
        if !self.has("value") {
            self.ensure_space();
            self.ensure_string();
            self.ensure_number();
            self.ensure_boolean();
            self.ensure_null();
            self.declare("value");
            self.declare("object");
            self.declare("array");
            self.declare("member");
            self.fill(
                "value",
                vec![
                    vec![rref("object")],
                    vec![rref("array")],
                    vec![rref("string")],
                    vec![rref("number")],
                    vec![rref("boolean")],
                    vec![rref("null")],
                ],
            );
            self.fill(
                "object",
                vec![vec![
                    lit("{"),
                    rref("space"),
                    group(
                        vec![vec![
                            rref("member"),
                            group(
                                vec![vec![lit(","), rref("space"), rref("member")]],
                                Repeat::ZeroOrMore,
                            ),
                        ]],
                        Repeat::Optional,
                    ),
                    lit("}"),
                    rref("space"),
                ]],
            );
            self.fill(
                "array",
                vec![vec![
                    lit("["),
                    rref("space"),
                    group(
                        vec![vec![
                            rref("value"),
                            group(
                                vec![vec![lit(","), rref("space"), rref("value")]],
                                Repeat::ZeroOrMore,
                            ),
                        ]],
                        Repeat::Optional,
                    ),
                    lit("]"),
                    rref("space"),
                ]],
            );
            self.fill(
                "member",
                vec![vec![rref("string"), lit(":"), rref("space"), rref("value")]],
            );
        }
        "value".into()
    }
}

//  Schema compilation

/// Keywords that change the shape of the accepted value in ways this
/// compiler cannot express. Their presence degrades the whole node.
const SHAPE_KEYWORDS: &[&str] = &[
    "oneOf", "anyOf", "allOf", "$ref", "enum", "const", "not", "if", "format", "pattern",
];

/// Refinements that are dropped while keeping the base type rule.
const IGNORED_KEYWORDS: &[&str] = &[
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "multipleOf",
];

fn compile_node(b: &mut RuleBuilder, schema: &Value, name: &str) -> Result<String> {
    let Some(obj) = schema.as_object() else {
        return b.degrade(format!("non-object schema at '{name}'"));
    };

    for key in SHAPE_KEYWORDS {
        if obj.contains_key(*key) {
            return b.degrade(format!("'{key}' at '{name}'"));
        }
    }
    for key in IGNORED_KEYWORDS {
        if obj.contains_key(*key) {
            b.note(format!("ignored constraint '{key}' at '{name}'"))?;
        }
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("string") => Ok(b.ensure_string()),
        Some("number") => Ok(b.ensure_number()),
        Some("integer") => Ok(b.ensure_integer()),
        Some("boolean") => Ok(b.ensure_boolean()),
        Some("null") => Ok(b.ensure_null()),
        Some("object") => compile_object(b, obj, name),
        Some("array") => compile_array(b, obj, name),
        Some(other) => b.degrade(format!("unknown type '{other}' at '{name}'")),
        None => b.degrade(format!("missing 'type' at '{name}'")),
    }
}

fn compile_object(
    b: &mut RuleBuilder,
    obj: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<String> {
    let Some(props) = obj.get("properties").and_then(Value::as_object) else {
        // No declared properties: any object shape is admissible.
        b.ensure_value();
        return Ok("object".into());
    };

    if let Some(extra) = obj.get("additionalProperties") {
        if extra != &Value::Bool(false) {
            b.note(format!("'additionalProperties' at '{name}'"))?;
        }
    }

    b.ensure_space();
    let mut seq = vec![lit("{"), rref("space")];
    // Every declared property is forced, in declaration order.
    for (i, (key, sub)) in props.iter().enumerate() {
        let child = compile_node(b, sub, &sanitize(&format!("{name}-{key}")))?;
        if i > 0 {
            seq.push(lit(","));
            seq.push(rref("space"));
        }
        seq.push(lit(json_literal(key)?));
        seq.push(rref("space"));
        seq.push(lit(":"));
        seq.push(rref("space"));
        seq.push(rref(&child));
    }
    seq.push(lit("}"));
    seq.push(rref("space"));
    Ok(b.add(name, vec![seq]))
}

fn compile_array(
    b: &mut RuleBuilder,
    obj: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<String> {
    let Some(items) = obj.get("items") else {
        b.ensure_value();
        return Ok("array".into());
    };
    let child = compile_node(b, items, &sanitize(&format!("{name}-item")))?;
    b.ensure_space();
    let seq = vec![
        lit("["),
        rref("space"),
        group(
            vec![vec![
                rref(&child),
                group(
                    vec![vec![lit(","), rref("space"), rref(&child)]],
                    Repeat::ZeroOrMore,
                ),
            ]],
            Repeat::Optional,
        ),
        lit("]"),
        rref("space"),
    ];
    Ok(b.add(name, vec![seq]))
}

/// Compile a JSON Schema document into a grammar whose root accepts
/// exactly the schema's instances (modulo the documented degradations).
pub fn from_json_schema(schema: &str, options: &SchemaOptions) -> Result<Arc<CompiledGrammar>> {
    let value: Value = serde_json::from_str(schema)
        .map_err(|e| SessionError::Schema(format!("malformed schema JSON: {e}")))?;

    let mut b = RuleBuilder::new(options.strict);
    let produced = compile_node(&mut b, &value, "root")?;
    if produced != "root" {
        b.add("root", vec![vec![rref(&produced)]]);
    }
    CompiledGrammar::compile("root", b.rules, b.degraded)
}

/// Compile a closed tool set into a call-envelope grammar.
///
/// The root accepts `{"id": …, "name": <declared tool>, "arguments": …}`;
/// with `allow_multiple`, an array of such envelopes under a `"tool_calls"`
/// key. Tool names are a literal alternation: adding a tool requires
/// resynthesis.
pub fn from_tool_specs(tools: &[ToolSpec], allow_multiple: bool) -> Result<Arc<CompiledGrammar>> {
    if tools.is_empty() {
        return Err(SessionError::Grammar("tool specification list is empty".into()));
    }

    let mut b = RuleBuilder::new(false);
    b.ensure_string();
    b.ensure_value();

    let mut choices = Vec::new();
    for tool in tools {
        let args = match &tool.parameters {
            Some(schema) => {
                compile_node(&mut b, schema, &sanitize(&format!("{}-args", tool.name)))?
            }
            None => "object".into(),
        };
        choices.push(vec![
            lit(json_literal(&tool.name)?),
            rref("space"),
            lit(","),
            rref("space"),
            lit("\"arguments\""),
            rref("space"),
            lit(":"),
            rref("space"),
            rref(&args),
        ]);
    }
    let choice = b.add("tool-name-args", choices);

    let call = b.add(
        "tool-call",
        vec![vec![
            lit("{"),
            rref("space"),
            lit("\"id\""),
            rref("space"),
            lit(":"),
            rref("space"),
            rref("string"),
            lit(","),
            rref("space"),
            lit("\"name\""),
            rref("space"),
            lit(":"),
            rref("space"),
            rref(&choice),
            lit("}"),
            rref("space"),
        ]],
    );

    let root_alts = if allow_multiple {
        vec![vec![
            lit("{"),
            rref("space"),
            lit("\"tool_calls\""),
            rref("space"),
            lit(":"),
            rref("space"),
            lit("["),
            rref("space"),
            rref(&call),
            group(
                vec![vec![lit(","), rref("space"), rref(&call)]],
                Repeat::ZeroOrMore,
            ),
            lit("]"),
            rref("space"),
            lit("}"),
            rref("space"),
        ]]
    } else {
        vec![vec![rref(&call)]]
    };
    b.add("root", root_alts);

    CompiledGrammar::compile("root", b.rules, b.degraded)
}
