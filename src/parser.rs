//! Configuration document grammar.
//!
//! Uses [`chumsky`] for the grammar. Alternatives are tried in order and
//! backtrack fully, so an object whose type token collides with a property
//! keyword (`set Foo { }`, `settings Foo { }`) is still read as an object.
//!
//! ```text
//! document      = element*
//! element       = comment | configuration | block | property | object | command
//! object        = word identifier [":" identifier] "{" element* "}"
//! property      = [conditional] ("set"|"add") word+ ":" value
//!               | ("set"|"add") word+ [conditional] "[" value* "]"
//! command       = [conditional] word [quoted | "(" text ")"]
//! block         = conditional "{" element* "}"
//! configuration = "configuration" identifier "[" (identifier ":" csv)* "]"
//! conditional   = "if" "(" text ")"
//! value         = xml | ["!"] "glob" quoted | ["!"] "regex" quoted | "none"
//!               | "[" value* "]" | key ":" value | quoted | word
//! ```

use std::collections::BTreeSet;

use chumsky::prelude::*;
use crate::ast::{
    ALWAYS, Action, CommandNode, ConditionalBlock, ConfigurationGroupNode, Document, Element,
    ObjectNode, PropertyNode, Value,
};
use crate::error::ParseError;

type Extra<'a> = extra::Err<Rich<'a, char>>;

/// Words that can never name a command.
const RESERVED: &[&str] = &["if", "set", "add", "configuration"];

// ═══════════════════════════════════════════════════════════════════════════════
//  Lexical primitives
// ═══════════════════════════════════════════════════════════════════════════════

fn is_word_start(c: &char) -> bool {
    c.is_ascii_alphabetic() || *c == '_'
}

fn is_word_char(c: &char) -> bool {
    c.is_ascii_alphanumeric() || *c == '_'
}

fn ws<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    any().filter(|c: &char| c.is_whitespace()).repeated().ignored()
}

fn inline_space<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    one_of(" \t").repeated().ignored()
}

/// `// text` up to the end of the line.
fn comment<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    just("//")
        .ignore_then(none_of("\r\n").repeated().to_slice())
        .map(|text: &str| text.trim().to_string())
        .labelled("comment")
}

/// Whitespace and comments that carry no meaning (inside headings and
/// values). Comments between elements are kept as [`Element::Comment`].
fn trivia<'a>() -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    choice((
        any().filter(|c: &char| c.is_whitespace()).ignored(),
        comment().ignored(),
    ))
    .repeated()
    .ignored()
}

/// `$(NAME)` or `\$(NAME)`, kept verbatim for later expansion.
fn variable<'a>() -> impl Parser<'a, &'a str, &'a str, Extra<'a>> + Clone {
    just('\\')
        .or_not()
        .then(just("$("))
        .then(none_of(")\r\n").repeated())
        .then(just(')'))
        .to_slice()
}

/// A plain `[A-Za-z_][A-Za-z0-9_]*` word.
fn word<'a>() -> impl Parser<'a, &'a str, &'a str, Extra<'a>> + Clone {
    any()
        .filter(is_word_start)
        .then(any().filter(is_word_char).repeated())
        .to_slice()
}

fn keyword<'a>(kw: &'static str) -> impl Parser<'a, &'a str, (), Extra<'a>> + Clone {
    word().filter(move |w: &&str| *w == kw).ignored().labelled(kw)
}

/// Letter-led identifier that may embed `$(VAR)` tokens, dots and dashes.
fn identifier<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    let start = choice((any().filter(is_word_start).ignored(), variable().ignored()));
    let rest = choice((
        any()
            .filter(|c: &char| is_word_char(c) || matches!(c, '.' | '-'))
            .ignored(),
        variable().ignored(),
    ));
    start
        .then(rest.repeated())
        .to_slice()
        .map(str::to_string)
        .labelled("identifier")
}

/// Unquoted value text.
fn bare_word<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    let plain = any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '/'))
        .and_is(just("//").not());
    choice((plain.ignored(), variable().ignored()))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(str::to_string)
        .labelled("word")
}

/// `"text"`. Only `\"` is an escape; other backslashes are kept so that
/// `\$(NAME)` reaches variable expansion intact.
fn quoted<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    just('"')
        .ignore_then(
            choice((just("\\\"").to('"'), none_of("\"\n")))
                .repeated()
                .collect::<String>(),
        )
        .then_ignore(just('"'))
        .labelled("quoted string")
}

/// Depth-counted `open ... close` group. Nested groups are matched
/// recursively; an unbalanced group fails. Returns the whole group,
/// delimiters included.
fn enclosed<'a>(open: char, close: char) -> impl Parser<'a, &'a str, &'a str, Extra<'a>> + Clone {
    recursive(move |group| {
        just(open)
            .then(choice((none_of([open, close]).ignored(), group.ignored())).repeated())
            .then(just(close))
            .to_slice()
    })
}

fn strip_delimiters(group: &str) -> &str {
    &group[1..group.len() - 1]
}

/// `if ( expr )`. The expression text is kept raw and compiled later
/// against each configuration's constants.
fn conditional<'a>() -> impl Parser<'a, &'a str, String, Extra<'a>> + Clone {
    keyword("if")
        .ignore_then(trivia())
        .ignore_then(enclosed('(', ')'))
        .map(|group: &str| strip_delimiters(group).trim().to_string())
        .labelled("conditional")
}

fn always() -> String {
    ALWAYS.to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Values
// ═══════════════════════════════════════════════════════════════════════════════

/// Remove the common indentation of an xml block and check that it is a
/// well-formed fragment.
fn format_xml(raw: &str) -> Result<String, String> {
    let lines: Vec<&str> = raw.lines().collect();
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let text = lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.get(indent..).unwrap_or_else(|| line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim().to_string();

    roxmltree::Document::parse(&format!("<fragment>{text}</fragment>"))
        .map_err(|e| format!("invalid xml block: {e}"))?;
    Ok(text)
}

fn xml_block<'a>() -> impl Parser<'a, &'a str, Value, Extra<'a>> + Clone {
    let fence = just("\"\"\"");
    keyword("xml")
        .ignore_then(trivia())
        .ignore_then(fence.clone())
        .ignore_then(any().and_is(fence.clone().not()).repeated().to_slice())
        .then_ignore(fence)
        .try_map(|raw: &str, span| {
            format_xml(raw)
                .map(Value::Xml)
                .map_err(|message| Rich::custom(span, message))
        })
        .labelled("xml block")
}

/// `[ item (,)? item ... ]`
fn array_of<'a, P>(item: P) -> impl Parser<'a, &'a str, Vec<Value>, Extra<'a>> + Clone
where
    P: Parser<'a, &'a str, Value, Extra<'a>> + Clone,
{
    item.then_ignore(trivia())
        .then_ignore(just(',').then(trivia()).or_not())
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just('[').then(trivia()), just(']'))
        .labelled("array")
}

fn value<'a>() -> impl Parser<'a, &'a str, Value, Extra<'a>> + Clone {
    recursive(|value| {
        let negation = just('!').or_not().map(|bang| bang.is_some());

        let glob = negation
            .clone()
            .then_ignore(keyword("glob"))
            .then_ignore(trivia())
            .then(quoted())
            .map(|(negated, pattern)| Value::Glob { pattern, negated });

        let regex = negation
            .then_ignore(keyword("regex"))
            .then_ignore(trivia())
            .then(quoted())
            .map(|(negated, pattern)| Value::Regex { pattern, negated });

        let none = bare_word().filter(|w: &String| w == "none").to(Value::None);

        let array = array_of(value.clone()).map(Value::Array);

        // `key : value` or a lone literal.
        let keyed = choice((quoted(), bare_word()))
            .then(
                trivia()
                    .ignore_then(just(':'))
                    .ignore_then(trivia())
                    .ignore_then(value)
                    .or_not(),
            )
            .map(|(key, value)| match value {
                Some(value) => Value::Pair(key, Box::new(value)),
                None => Value::Literal(key),
            });

        choice((xml_block(), glob, regex, none, array, keyed))
            .labelled("value")
            .boxed()
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Elements
// ═══════════════════════════════════════════════════════════════════════════════

fn configuration_group<'a>() -> impl Parser<'a, &'a str, Element, Extra<'a>> + Clone {
    // A constant is any identifier not immediately starting the next entry.
    let constant = identifier().then_ignore(trivia().then(just(':')).not());
    let constants = constant
        .separated_by(trivia().then(just(',')).then(trivia()))
        .collect::<Vec<String>>();
    let entry = identifier()
        .then_ignore(trivia())
        .then_ignore(just(':'))
        .then_ignore(trivia())
        .then(constants)
        .then_ignore(trivia());

    keyword("configuration")
        .ignore_then(trivia())
        .ignore_then(identifier())
        .then_ignore(trivia())
        .then(
            entry
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just('[').then(trivia()), just(']')),
        )
        .map(|(name, entries)| {
            let configs = entries
                .into_iter()
                .map(|(config, constants)| (config, constants.into_iter().collect::<BTreeSet<_>>()))
                .collect();
            Element::ConfigurationGroup(ConfigurationGroupNode { name, configs })
        })
        .labelled("configuration group")
}

fn elements<'a>() -> impl Parser<'a, &'a str, Vec<Element>, Extra<'a>> + Clone {
    recursive(|elements| {
        let body = elements.delimited_by(just('{'), just('}')).boxed();

        let action = choice((
            keyword("set").to(Action::Set),
            keyword("add").to(Action::Add),
        ));
        let name_parts = word()
            .filter(|w: &&str| *w != "if")
            .map(str::to_string)
            .then_ignore(trivia())
            .repeated()
            .at_least(1)
            .collect::<Vec<String>>();

        // ── set|add name : value ─────────────────────────────────────────
        let single_property = conditional()
            .then_ignore(trivia())
            .or_not()
            .then(action.clone())
            .then_ignore(trivia())
            .then(name_parts.clone())
            .then_ignore(just(':'))
            .then_ignore(trivia())
            .then(value())
            // `set Foo : Bar { ... }` is an object heading, not a property.
            .then_ignore(trivia().then(just('{')).not())
            .map(|(((conditional, action), name_parts), value)| {
                Element::Property(PropertyNode {
                    action,
                    name_parts,
                    value,
                    conditional: conditional.unwrap_or_else(always),
                })
            })
            .labelled("property");

        // ── set|add name [if (expr)] [ values ] ──────────────────────────
        let array_property = action
            .then_ignore(trivia())
            .then(name_parts)
            .then(conditional().then_ignore(trivia()).or_not())
            .then(array_of(value()))
            .map(|(((action, name_parts), conditional), values)| {
                Element::Property(PropertyNode {
                    action,
                    name_parts,
                    value: Value::Array(values),
                    conditional: conditional.unwrap_or_else(always),
                })
            })
            .labelled("array property");

        // ── type name [: base] { ... } ───────────────────────────────────
        let object = word()
            .map(str::to_string)
            .then_ignore(trivia())
            .then(identifier())
            .then_ignore(trivia())
            .then(
                just(':')
                    .ignore_then(trivia())
                    .ignore_then(identifier())
                    .then_ignore(trivia())
                    .or_not(),
            )
            .then(body.clone())
            .map(|(((object_type, name), inherits), children)| {
                Element::Object(ObjectNode { object_type, name, inherits, children })
            })
            .labelled("object");

        // ── if (expr) { ... } ────────────────────────────────────────────
        let block = conditional()
            .then_ignore(trivia())
            .then(body)
            .map(|(conditional, children)| {
                Element::ConditionalBlock(ConditionalBlock { conditional, children })
            })
            .labelled("conditional block");

        // ── [if (expr)] name ["arg" | (arg)] ─────────────────────────────
        let argument = choice((
            quoted(),
            enclosed('(', ')').map(|group: &str| strip_delimiters(group).to_string()),
        ));
        let command = conditional()
            .then_ignore(trivia())
            .or_not()
            .then(word().filter(|w: &&str| !RESERVED.contains(w)).map(str::to_string))
            .then(inline_space().ignore_then(argument).or_not())
            .map(|((conditional, name), argument)| {
                Element::Command(CommandNode {
                    name,
                    argument,
                    conditional: conditional.unwrap_or_else(always),
                })
            })
            .labelled("command");

        let element = choice((
            comment().map(Element::Comment),
            configuration_group(),
            block,
            single_property,
            array_property,
            object,
            command,
        ))
        .boxed();

        ws().ignore_then(element.then_ignore(ws()).repeated().collect::<Vec<_>>())
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Entry points
// ═══════════════════════════════════════════════════════════════════════════════

fn to_parse_error(source: &str, errs: Vec<Rich<'_, char>>) -> ParseError {
    match errs.into_iter().max_by_key(|e| e.span().start) {
        Some(err) => ParseError::at(source, err.span().start, err.to_string()),
        None => ParseError::at(source, 0, "unknown syntax error"),
    }
}

/// Parse a complete configuration document.
pub fn parse_document(source: &str) -> Result<Document, ParseError> {
    elements()
        .then_ignore(end())
        .parse(source)
        .into_result()
        .map(|elements| Document { elements })
        .map_err(|errs| to_parse_error(source, errs))
}

/// Match one parenthesised group spanning the whole input.
pub fn parse_enclosed(input: &str) -> Result<&str, ParseError> {
    enclosed('(', ')')
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errs| to_parse_error(input, errs))
}

/// Parse a single value, e.g. `[glob "**/*.cs", !regex "Generated"]`.
pub fn parse_value(input: &str) -> Result<Value, ParseError> {
    ws().ignore_then(value())
        .then_ignore(ws())
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errs| to_parse_error(input, errs))
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
