//! `$(NAME)` variable bindings and expansion.
//!
//! Bindings are an immutable value threaded through the compile and resolve
//! calls: entering a module, configuration or project derives a new binding
//! set with [`Bindings::with`] instead of mutating shared state, so nothing
//! needs restoring on any exit path.
//!
//! `\$(NAME)` escapes a reference. A backslash run in front of `$(` is
//! halved, and an odd run escapes the reference, so `\\$(NAME)` is a
//! backslash followed by the expanded value. Escapes survive
//! [`Expansion::Partial`] and collapse to the literal text `$(NAME)` on
//! [`Expansion::Final`].

use std::collections::BTreeMap;

use crate::error::{CompileError, Result};

/// Well-known binding names.
pub const SOLUTION_NAME: &str = "SOLUTION_NAME";
pub const CONFIGURATION: &str = "CONFIGURATION";
pub const CONFIGURATION_GROUP: &str = "CONFIGURATION_GROUP";
pub const TEMPLATE_NAME: &str = "TEMPLATE_NAME";
pub const MODULE_NAME: &str = "MODULE_NAME";
pub const PROJECT_NAME: &str = "PROJECT_NAME";

/// How unbound references and escapes are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// Leave unbound references and escapes verbatim for a later pass.
    Partial,
    /// Unbound references are errors; escapes become literal text.
    Final,
}

/// An immutable set of variable bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of these bindings with `name` bound to `value`.
    pub fn with(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.values.insert(name.into(), value.into());
        next
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Expand every `$(NAME)` reference in `text`.
    ///
    /// Substituted values are literal text: they are not expanded again,
    /// neither now nor by a later pass over a partial result.
    pub fn expand(&self, text: &str, mode: Expansion) -> Result<String> {
        if !text.contains("$(") {
            return Ok(text.to_string());
        }

        let mut result = String::with_capacity(text.len());
        // Text that must come out of a final pass unchanged.
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find("$(") {
            let prefix = &rest[..start];
            let slashes = prefix.len() - prefix.trim_end_matches('\\').len();
            literal.push_str(&prefix[..start - slashes]);
            push_slashes(&mut literal, slashes / 2);

            let after = &rest[start + 2..];
            let close = after
                .find(')')
                .ok_or_else(|| CompileError::UnterminatedVariable(text.to_string()))?;
            let name = &after[..close];
            let reference = &rest[start..start + 2 + close + 1];

            if slashes % 2 == 1 {
                literal.push_str(reference);
            } else {
                match self.values.get(name) {
                    Some(value) => literal.push_str(value),
                    None if mode == Expansion::Partial => {
                        push_escaped(&mut result, &literal, true);
                        literal.clear();
                        result.push_str(reference);
                    }
                    None => return Err(CompileError::UnboundVariable(name.to_string())),
                }
            }

            rest = &after[close + 1..];
        }

        literal.push_str(rest);
        match mode {
            Expansion::Partial => push_escaped(&mut result, &literal, false),
            Expansion::Final => result.push_str(&literal),
        }
        Ok(result)
    }
}

fn push_slashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat_n('\\', count));
}

/// Append `literal` so that a final pass reads it back verbatim: every
/// `$(` gets an odd backslash run, and backslashes that end up in front of
/// a following reference are doubled.
fn push_escaped(out: &mut String, literal: &str, before_reference: bool) {
    let mut rest = literal;
    while let Some(start) = rest.find("$(") {
        let prefix = &rest[..start];
        let slashes = prefix.len() - prefix.trim_end_matches('\\').len();
        out.push_str(&prefix[..start - slashes]);
        push_slashes(out, 2 * slashes + 1);
        out.push_str("$(");
        rest = &rest[start + 2..];
    }
    if before_reference {
        let slashes = rest.len() - rest.trim_end_matches('\\').len();
        out.push_str(&rest[..rest.len() - slashes]);
        push_slashes(out, 2 * slashes);
    } else {
        out.push_str(rest);
    }
}

impl<K, V> FromIterator<(K, V)> for Bindings
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K, V> Extend<(K, V)> for Bindings
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.values.insert(k.into(), v.into());
        }
    }
}
