//! Error types shared by the parser, the conditional evaluator and the
//! settings / template / module resolvers.

use thiserror::Error;

/// Result alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;

/// A syntax error in a configuration document.
///
/// `offset` is a byte offset into the source; `line` and `column` are
/// 1-based and counted in characters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at {line}:{column}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    /// Build an error for `offset` in `source`, computing line and column.
    pub fn at(source: &str, offset: usize, message: impl Into<String>) -> Self {
        let offset = offset.min(source.len());
        let before = source.get(..offset).unwrap_or(source);
        let line = before.matches('\n').count() + 1;
        let column = before
            .rsplit('\n')
            .next()
            .map(|tail| tail.chars().count() + 1)
            .unwrap_or(1);
        Self { offset, line, column, message: message.into() }
    }
}

/// A malformed boolean conditional expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid conditional '{expression}': {message}")]
pub struct ConditionError {
    pub expression: String,
    pub message: String,
}

/// Every failure the compiler can report.
///
/// None of these are recovered from: the smallest enclosing unit (a settings
/// object, a template configuration, or the whole document) fails.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] ParseError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    // ── Registry ──
    #[error("unrecognized property '{0}'")]
    UnrecognizedProperty(String),

    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("'add' is not a valid action for scalar property '{0}'")]
    InvalidAction(String),

    #[error("invalid value for property '{property}': {message}")]
    InvalidValue { property: String, message: String },

    #[error("malformed '{property}' declaration {found}: expected `name : value`")]
    MalformedDeclaration { property: String, found: String },

    // ── Inheritance ──
    #[error("'{object}' inherits '{base}', which has not been compiled yet")]
    BaseNotCompiled { object: String, base: String },

    #[error("'{object}' inherits unknown settings '{base}'")]
    UnknownBase { object: String, base: String },

    #[error("cyclic inheritance between settings: {}", .0.join(", "))]
    CyclicInheritance(Vec<String>),

    // ── Declarations ──
    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("template '{0}' declares no projects")]
    MissingProjectDeclarations(String),

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("module '{0}' does not name a template (expected `module {0} : TemplateName`)")]
    MissingTemplate(String),

    #[error("project '{project}' is bound to unknown settings '{settings}'")]
    UnknownSettings { project: String, settings: String },

    #[error("unexpected {found} '{name}' inside {parent}")]
    UnexpectedObject { found: String, name: String, parent: String },

    #[error("unknown configuration group '{0}'")]
    UnknownConfigurationGroup(String),

    #[error("the document declares no configurations")]
    NoConfigurations,

    // ── Projects ──
    #[error("project '{project}' references '{reference}', which is not an included project")]
    InvalidProjectReference { project: String, reference: String },

    #[error("invalid project guid '{0}'")]
    InvalidGuid(String),

    #[error("project '{project}' has a different {field} in {configuration}")]
    InconsistentProjectIdentity {
        project: String,
        field: &'static str,
        configuration: String,
    },

    // ── Expansion / patterns ──
    #[error("unbound variable '$({0})'")]
    UnboundVariable(String),

    #[error("unterminated variable reference in '{0}'")]
    UnterminatedVariable(String),

    #[error("invalid {kind} pattern '{pattern}': {message}")]
    InvalidPattern {
        kind: &'static str,
        pattern: String,
        message: String,
    },

    /// Raised by the `error "..."` command.
    #[error("{0}")]
    User(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<CompileError>,
    },
}

impl CompileError {
    /// Strip any [`CompileError::Context`] layers.
    pub fn root(&self) -> &CompileError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Attach a diagnostic context (object heading, configuration, ...) to an
/// error on its way out.
pub trait ResultExt<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CompileError>,
{
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|error| CompileError::Context {
            context: f().into(),
            source: Box::new(error.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_line_and_column() {
        let source = "first\nsecond line\nthird";
        let err = ParseError::at(source, 13, "boom");
        assert_eq!((err.line, err.column), (2, 8));
        assert_eq!(err.to_string(), "syntax error at 2:8: boom");
    }

    #[test]
    fn parse_error_offset_past_end_is_clamped() {
        let err = ParseError::at("abc", 99, "eof");
        assert_eq!(err.offset, 3);
        assert_eq!((err.line, err.column), (1, 4));
    }

    #[test]
    fn context_layers_unwrap_to_root() {
        let result: std::result::Result<(), CompileError> =
            Err(CompileError::InvalidAction("target framework".into()));
        let err = result
            .with_context(|| "settings Core")
            .with_context(|| "template Library [everything|Debug]")
            .unwrap_err();
        assert!(matches!(err.root(), CompileError::InvalidAction(name) if name == "target framework"));
        assert!(err.to_string().starts_with("template Library [everything|Debug]: settings Core: "));
    }
}
