//! Typed syntax tree produced by [`crate::parser`].
//!
//! The tree is built once from source text and never mutated afterwards.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ParseError;

/// Conditional carried by every element that has none of its own.
pub const ALWAYS: &str = "true";

// ═══════════════════════════════════════════════════════════════════════════════
//  Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// `"text"` or a bare word.
    Literal(String),
    /// `glob "pattern"` / `!glob "pattern"`.
    Glob { pattern: String, negated: bool },
    /// `regex "pattern"` / `!regex "pattern"`.
    Regex { pattern: String, negated: bool },
    /// `xml """ ... """`, dedented and checked for well-formedness.
    Xml(String),
    /// The `none` sentinel.
    None,
    /// `[ value* ]`.
    Array(Vec<Value>),
    /// `key : value`.
    Pair(String, Box<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bang = |negated: bool| if negated { "!" } else { "" };
        match self {
            Value::Literal(text) => write!(f, "\"{text}\""),
            Value::Glob { pattern, negated } => write!(f, "{}glob \"{pattern}\"", bang(*negated)),
            Value::Regex { pattern, negated } => write!(f, "{}regex \"{pattern}\"", bang(*negated)),
            Value::Xml(text) => write!(f, "xml \"\"\"{text}\"\"\""),
            Value::None => f.write_str("none"),
            Value::Array(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Value::Pair(key, value) => write!(f, "{key}: {value}"),
        }
    }
}

/// Property action keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `set`: replace the current value.
    Set,
    /// `add`: merge into the current collection.
    Add,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Set => "set",
            Action::Add => "add",
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Elements
// ═══════════════════════════════════════════════════════════════════════════════

/// One element of a document or object body.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Object(ObjectNode),
    Property(PropertyNode),
    Command(CommandNode),
    ConditionalBlock(ConditionalBlock),
    ConfigurationGroup(ConfigurationGroupNode),
    Comment(String),
}

/// `type name [: inherits] { children }`
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub object_type: String,
    pub name: String,
    pub inherits: Option<String>,
    pub children: Vec<Element>,
}

impl ObjectNode {
    /// `type name` or `type name : base`, used in diagnostics.
    pub fn heading(&self) -> String {
        match &self.inherits {
            Some(base) => format!("{} {} : {}", self.object_type, self.name, base),
            None => format!("{} {}", self.object_type, self.name),
        }
    }

    /// Direct child objects, in document order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectNode> {
        self.children.iter().filter_map(|child| match child {
            Element::Object(object) => Some(object),
            _ => None,
        })
    }
}

/// `set|add name words : value`, optionally guarded by `if (expr)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyNode {
    pub action: Action,
    pub name_parts: Vec<String>,
    pub value: Value,
    pub conditional: String,
}

impl PropertyNode {
    /// Registry key: the name words joined by single spaces.
    pub fn full_name(&self) -> String {
        self.name_parts.join(" ")
    }
}

/// `name ["argument" | (argument)]`, optionally guarded by `if (expr)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandNode {
    pub name: String,
    pub argument: Option<String>,
    pub conditional: String,
}

/// `if (expr) { children }`
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBlock {
    pub conditional: String,
    pub children: Vec<Element>,
}

/// `configuration name [ Config: CONST, ... ]`
///
/// Entries keep document order; duplicate names are reported by the
/// resolver as a declaration error.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationGroupNode {
    pub name: String,
    pub configs: Vec<(String, BTreeSet<String>)>,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Document
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed configuration document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub elements: Vec<Element>,
}

impl Document {
    /// Parse source text. No partial tree is returned on failure.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        crate::parser::parse_document(source)
    }

    /// Top-level objects, in document order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectNode> {
        self.elements.iter().filter_map(|element| match element {
            Element::Object(object) => Some(object),
            _ => None,
        })
    }
}
