//! File and name patterns, and the pattern-matching collaborator that turns
//! `include files` / `exclude files` into a concrete file set.
//!
//! A pattern is a literal, a glob or a regex, optionally negated. Negation
//! inverts the match. Paths are always compared with `/` separators,
//! relative to the search root.
//!
//! Globs without a `/` are matched against the file name only, so
//! `glob "*.cs"` finds sources at any depth; globs with a `/` are matched
//! against the whole relative path. Regexes search the whole relative path.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::ast::Value;
use crate::error::{CompileError, Result, ResultExt};

// ═══════════════════════════════════════════════════════════════════════════════
//  Pattern
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Literal,
    Glob,
    Regex,
}

impl PatternKind {
    fn as_str(self) -> &'static str {
        match self {
            PatternKind::Literal => "literal",
            PatternKind::Glob => "glob",
            PatternKind::Regex => "regex",
        }
    }
}

/// A typed, uncompiled pattern as declared in a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub kind: PatternKind,
    pub text: String,
    pub negated: bool,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self { kind: PatternKind::Literal, text: text.into(), negated: false }
    }

    pub fn glob(text: impl Into<String>) -> Self {
        Self { kind: PatternKind::Glob, text: text.into(), negated: false }
    }

    pub fn regex(text: impl Into<String>) -> Self {
        Self { kind: PatternKind::Regex, text: text.into(), negated: false }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Convert a parsed value into a pattern. Only literals, globs and
    /// regexes qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Literal(text) => Some(Self::literal(text.clone())),
            Value::Glob { pattern, negated } => Some(Self {
                kind: PatternKind::Glob,
                text: pattern.clone(),
                negated: *negated,
            }),
            Value::Regex { pattern, negated } => Some(Self {
                kind: PatternKind::Regex,
                text: pattern.clone(),
                negated: *negated,
            }),
            _ => None,
        }
    }

    /// Same pattern with different text (used by variable expansion).
    pub fn with_text(&self, text: String) -> Self {
        Self { kind: self.kind, text, negated: self.negated }
    }

    pub fn compile(&self) -> Result<CompiledPattern> {
        let invalid = |message: String| CompileError::InvalidPattern {
            kind: self.kind.as_str(),
            pattern: self.text.clone(),
            message,
        };
        let matcher = match self.kind {
            PatternKind::Literal => Compiled::Literal(normalize(&self.text)),
            PatternKind::Glob => {
                let text = normalize(&self.text);
                let whole_path = text.contains('/');
                glob::Pattern::new(&text)
                    .map(|pattern| Compiled::Glob { pattern, whole_path })
                    .map_err(|e| invalid(e.to_string()))?
            }
            PatternKind::Regex => Regex::new(&self.text)
                .map(Compiled::Regex)
                .map_err(|e| invalid(e.to_string()))?,
        };
        Ok(CompiledPattern { matcher, negated: self.negated })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bang = if self.negated { "!" } else { "" };
        match self.kind {
            PatternKind::Literal => write!(f, "{bang}\"{}\"", self.text),
            kind => write!(f, "{bang}{} \"{}\"", kind.as_str(), self.text),
        }
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").map(str::to_string).unwrap_or(path)
}

#[derive(Debug, Clone)]
enum Compiled {
    Literal(String),
    Glob { pattern: glob::Pattern, whole_path: bool },
    Regex(Regex),
}

/// A pattern ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    matcher: Compiled,
    negated: bool,
}

impl CompiledPattern {
    /// Match a `/`-separated relative path or a plain name.
    pub fn is_match(&self, candidate: &str) -> bool {
        let candidate = normalize(candidate);
        let hit = match &self.matcher {
            Compiled::Literal(text) => candidate == *text,
            Compiled::Glob { pattern, whole_path } => {
                if *whole_path {
                    pattern.matches(&candidate)
                } else {
                    let name = candidate.rsplit('/').next().unwrap_or(&candidate);
                    pattern.matches(name)
                }
            }
            Compiled::Regex(regex) => regex.is_match(&candidate),
        };
        hit != self.negated
    }
}

/// Compile a pattern list, failing on the first invalid pattern.
pub fn compile_all<'p>(patterns: impl IntoIterator<Item = &'p Pattern>) -> Result<Vec<CompiledPattern>> {
    patterns.into_iter().map(Pattern::compile).collect()
}

/// Project-name whitelist. An empty whitelist admits every name.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    patterns: Vec<CompiledPattern>,
}

impl Whitelist {
    pub fn new(patterns: &[Pattern]) -> Result<Self> {
        Ok(Self { patterns: compile_all(patterns)? })
    }

    pub fn is_active(&self) -> bool {
        !self.patterns.is_empty()
    }

    pub fn allows(&self, name: &str) -> bool {
        !self.is_active() || self.patterns.iter().any(|p| p.is_match(name))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Matcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves include / exclude patterns to a set of files under `root`.
///
/// Returned paths are relative to `root`. A path matched by any exclude
/// pattern is never returned.
pub trait PatternMatcher: fmt::Debug + Send + Sync {
    fn matches(&self, include: &[Pattern], exclude: &[Pattern], root: &Path) -> Result<BTreeSet<PathBuf>>;
}

/// Walks the file system below the search root, following symlinks. Any
/// entry that cannot be read (permissions, a symlink loop, a dangling link)
/// fails the match instead of shrinking the file set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemMatcher;

impl PatternMatcher for FileSystemMatcher {
    fn matches(&self, include: &[Pattern], exclude: &[Pattern], root: &Path) -> Result<BTreeSet<PathBuf>> {
        let mut files = BTreeSet::new();
        if include.is_empty() {
            return Ok(files);
        }
        let include = compile_all(include)?;
        let exclude = compile_all(exclude)?;

        if !root.is_dir() {
            warn!(root = %root.display(), "source directory does not exist");
            return Ok(files);
        }

        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry
                .map_err(std::io::Error::from)
                .with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let candidate = relative.to_string_lossy();
            if include.iter().any(|p| p.is_match(&candidate))
                && !exclude.iter().any(|p| p.is_match(&candidate))
            {
                files.insert(relative.to_path_buf());
            }
        }

        debug!(root = %root.display(), count = files.len(), "matched files");
        Ok(files)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/gen")).unwrap();
        for file in ["src/a.cs", "src/gen/b.cs", "src/c.txt", "README.md"] {
            fs::write(dir.path().join(file), "").unwrap();
        }
        dir
    }

    fn paths(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn glob_without_separator_matches_file_names() {
        let pattern = Pattern::glob("*.cs").compile().unwrap();
        assert!(pattern.is_match("src/gen/b.cs"));
        assert!(!pattern.is_match("src/c.txt"));
    }

    #[test]
    fn glob_with_separator_matches_whole_path() {
        let pattern = Pattern::glob("src/*.cs").compile().unwrap();
        assert!(pattern.is_match("src/a.cs"));
        assert!(pattern.is_match("src\\a.cs"));
        assert!(!pattern.is_match("lib/a.cs"));
    }

    #[test]
    fn negation_inverts_match() {
        let pattern = Pattern::regex("Generated").negate().compile().unwrap();
        assert!(pattern.is_match("src/a.cs"));
        assert!(!pattern.is_match("src/Generated/a.cs"));
    }

    #[test]
    fn literal_matches_exact_path() {
        let pattern = Pattern::literal("./src/a.cs").compile().unwrap();
        assert!(pattern.is_match("src/a.cs"));
        assert!(!pattern.is_match("src/a.csx"));
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let err = Pattern::regex("(unclosed").compile().unwrap_err();
        assert!(matches!(err, CompileError::InvalidPattern { kind: "regex", .. }));
        let err = Pattern::glob("[").compile().unwrap_err();
        assert!(matches!(err, CompileError::InvalidPattern { kind: "glob", .. }));
    }

    #[test]
    fn from_value_accepts_only_pattern_like_values() {
        let glob = Value::Glob { pattern: "*.cs".into(), negated: true };
        assert_eq!(Pattern::from_value(&glob), Some(Pattern::glob("*.cs").negate()));
        assert_eq!(Pattern::from_value(&Value::None), None);
        assert_eq!(Pattern::glob("*.cs").negate().to_string(), "!glob \"*.cs\"");
    }

    #[test]
    fn whitelist_admits_everything_until_populated() {
        let open = Whitelist::default();
        assert!(!open.is_active());
        assert!(open.allows("Anything"));

        let whitelist = Whitelist::new(&[Pattern::literal("Core"), Pattern::regex("^Tools\\.")]).unwrap();
        assert!(whitelist.allows("Core"));
        assert!(whitelist.allows("Tools.Cli"));
        assert!(!whitelist.allows("Core.Tests"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let dir = source_tree();
        let files = FileSystemMatcher
            .matches(&[Pattern::glob("*.cs")], &[Pattern::regex("gen/")], dir.path())
            .unwrap();
        assert_eq!(files, paths(&["src/a.cs"]));
    }

    #[test]
    fn no_include_patterns_means_no_files() {
        let dir = source_tree();
        let files = FileSystemMatcher.matches(&[], &[], dir.path()).unwrap();
        assert!(files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_fail_the_match() {
        let dir = source_tree();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("src/gen/loop")).unwrap();
        let err = FileSystemMatcher
            .matches(&[Pattern::glob("*.cs")], &[], dir.path())
            .unwrap_err();
        assert!(matches!(err.root(), CompileError::Io(_)), "{err}");

        let dir = source_tree();
        std::os::unix::fs::symlink(dir.path().join("missing.cs"), dir.path().join("src/dangling.cs")).unwrap();
        let err = FileSystemMatcher
            .matches(&[Pattern::glob("*.cs")], &[], dir.path())
            .unwrap_err();
        assert!(err.to_string().starts_with("walking "), "{err}");
    }

    #[test]
    fn missing_root_yields_empty_set() {
        let dir = source_tree();
        let files = FileSystemMatcher
            .matches(&[Pattern::glob("*")], &[], &dir.path().join("missing"))
            .unwrap();
        assert!(files.is_empty());
    }
}
