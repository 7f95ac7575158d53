//! Boolean conditional parser and evaluator.
//!
//! Conditionals guard properties, commands and blocks, for example:
//!
//! - `DEBUG`
//! - `!RELEASE && (x64 || arm64)`
//! - `everything && !CI`
//!
//! An identifier is true when it is one of the *defined constants* of the
//! configuration being compiled. `true` and `false` are fixed and ignore the
//! constant set.
//!
//! Uses [`chumsky`] for the parsing grammar.
//!
//! ## Grammar (whitespace is insignificant)
//!
//! ```text
//! or_expr  = and_expr ('||' and_expr)*
//! and_expr = unary ('&&' unary)*
//! unary    = '!'* atom
//! atom     = identifier | '(' or_expr ')'
//! ```

use std::collections::BTreeSet;

use chumsky::prelude::*;

use crate::ast::ALWAYS;
use crate::error::ConditionError;

// ═══════════════════════════════════════════════════════════════════════════════
//  AST
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed conditional expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A defined-constant reference (or the fixed `true` / `false`).
    Constant(String),
    /// `!a`.
    Not(Box<Condition>),
    /// `a && b`.
    And(Box<Condition>, Box<Condition>),
    /// `a || b`.
    Or(Box<Condition>, Box<Condition>),
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Chumsky parser
// ═══════════════════════════════════════════════════════════════════════════════

fn condition_parser<'a>() -> impl Parser<'a, &'a str, Condition, extra::Err<Rich<'a, char>>> {
    recursive(|expr| {
        let identifier = any()
            .filter(|c: &char| c.is_ascii_alphabetic() || *c == '_')
            .then(
                any()
                    .filter(|c: &char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
                    .repeated(),
            )
            .to_slice()
            .map(|name: &str| Condition::Constant(name.to_string()))
            .labelled("constant");

        let group = expr.delimited_by(just('(').padded(), just(')').padded());

        let atom = choice((identifier, group)).padded();

        // ── '!', prefix, binds tightest ─────────────────────────────────
        let unary = just('!')
            .padded()
            .repeated()
            .foldr(atom, |_, operand| Condition::Not(Box::new(operand)));

        // ── '&&', higher precedence than '||' ───────────────────────────
        let and_expr = unary.clone().foldl(
            just("&&").padded().ignore_then(unary).repeated(),
            |lhs, rhs| Condition::And(Box::new(lhs), Box::new(rhs)),
        );

        // ── '||', lowest precedence ─────────────────────────────────────
        and_expr.clone().foldl(
            just("||").padded().ignore_then(and_expr).repeated(),
            |lhs, rhs| Condition::Or(Box::new(lhs), Box::new(rhs)),
        )
    })
}

/// Parse a conditional expression into a [`Condition`] tree.
pub fn parse_condition(input: &str) -> Result<Condition, ConditionError> {
    condition_parser()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errs| {
            let messages: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
            ConditionError {
                expression: input.to_string(),
                message: messages.join("; "),
            }
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluate a parsed condition against a set of defined constants.
pub fn evaluate(condition: &Condition, constants: &BTreeSet<String>) -> bool {
    match condition {
        Condition::Constant(name) => match name.as_str() {
            "true" => true,
            "false" => false,
            other => constants.contains(other),
        },
        Condition::Not(operand) => !evaluate(operand, constants),
        Condition::And(lhs, rhs) => evaluate(lhs, constants) && evaluate(rhs, constants),
        Condition::Or(lhs, rhs) => evaluate(lhs, constants) || evaluate(rhs, constants),
    }
}

/// Parse and evaluate `expression` in one step.
pub fn compile(expression: &str, constants: &BTreeSet<String>) -> Result<bool, ConditionError> {
    if expression.trim() == ALWAYS {
        return Ok(true);
    }
    parse_condition(expression).map(|condition| evaluate(&condition, constants))
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn constants(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn constant(name: &str) -> Box<Condition> {
        Box::new(Condition::Constant(name.into()))
    }

    // ── Parsing ──────────────────────────────────────────────────────────

    #[test]
    fn parse_single_identifier() {
        assert_eq!(parse_condition("DEBUG").unwrap(), Condition::Constant("DEBUG".into()));
    }

    #[test]
    fn parse_and_binds_tighter_than_or() {
        let expr = parse_condition("a || b && c").unwrap();
        assert_eq!(
            expr,
            Condition::Or(constant("a"), Box::new(Condition::And(constant("b"), constant("c"))))
        );
    }

    #[test]
    fn parse_left_associative() {
        let expr = parse_condition("a && b && c").unwrap();
        assert_eq!(
            expr,
            Condition::And(Box::new(Condition::And(constant("a"), constant("b"))), constant("c"))
        );
    }

    #[test]
    fn parse_negated_group() {
        let expr = parse_condition("!(a || b)").unwrap();
        assert_eq!(
            expr,
            Condition::Not(Box::new(Condition::Or(constant("a"), constant("b"))))
        );
    }

    #[test]
    fn parse_ignores_whitespace() {
        let spaced = parse_condition("  ( a ||b )&&  ! c ").unwrap();
        let tight = parse_condition("(a||b)&&!c").unwrap();
        assert_eq!(spaced, tight);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for input in ["", "   ", "a &&", "|| a", "(a", "a b", "a & b", "a)"] {
            let err = parse_condition(input).unwrap_err();
            assert_eq!(err.expression, input);
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────────

    #[test]
    fn eval_identifier_membership() {
        let defined = constants(&["Debug", "DEBUG"]);
        assert!(compile("DEBUG", &defined).unwrap());
        assert!(!compile("RELEASE", &defined).unwrap());
        assert!(compile("!RELEASE", &defined).unwrap());
    }

    #[test]
    fn eval_true_and_false_ignore_constants() {
        for defined in [constants(&[]), constants(&["false"]), constants(&["true", "false"])] {
            assert!(compile("true", &defined).unwrap());
            assert!(!compile("false", &defined).unwrap());
            assert!(!compile("!true", &defined).unwrap());
        }
    }

    #[test]
    fn eval_precedence() {
        let none = constants(&[]);
        assert!(compile("true||true&&false", &none).unwrap());
        assert!(!compile("(true||true)&&false", &none).unwrap());
    }

    #[test]
    fn eval_is_deterministic() {
        let defined = constants(&["x64", "Release"]);
        let expr = "Release && (x86 || x64) && !CI";
        let first = compile(expr, &defined).unwrap();
        let second = compile(expr, &defined).unwrap();
        assert!(first);
        assert_eq!(first, second);
    }

    #[test]
    fn compile_reports_syntax_errors() {
        let err = compile("a &&& b", &constants(&["a"])).unwrap_err();
        assert_eq!(err.expression, "a &&& b");
        assert!(!err.message.is_empty());
    }
}
