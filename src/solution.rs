//! Solution resolution: configuration groups, solution settings, templates
//! and modules, and the [`SolutionBuilder`] that drives them.
//!
//! A document's top-level elements form the solution body. They may instead
//! be wrapped in a single `solution Name { ... }` object, which also names
//! the solution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::ast::{Document, Element, ObjectNode};
use crate::error::{CompileError, Result, ResultExt};
use crate::matcher::{FileSystemMatcher, PatternMatcher, Whitelist};
use crate::module::{Module, ModuleResolver, Project};
use crate::registry::names::{INCLUDE_PROJECTS, OUTPUT_PATH};
use crate::registry::{Context, Registry};
use crate::settings::{Settings, SettingsCompiler};
use crate::template::Template;
use crate::variables::{Bindings, CONFIGURATION, CONFIGURATION_GROUP, Expansion, SOLUTION_NAME};

pub const SOLUTION: &str = "solution";
pub const TEMPLATE: &str = "template";
pub const MODULE: &str = "module";

/// Name of a solution without a `solution` wrapper object.
pub const DEFAULT_NAME: &str = "Solution";

// ═══════════════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// One build variant, e.g. `Debug` in group `everything`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Configuration {
    pub group: String,
    pub name: String,
    /// Defined constants for conditionals. Always holds the configuration
    /// name and the group name.
    pub constants: BTreeSet<String>,
}

impl Configuration {
    pub fn new<I, S>(group: impl Into<String>, name: impl Into<String>, constants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group = group.into();
        let name = name.into();
        let mut constants: BTreeSet<String> = constants.into_iter().map(Into::into).collect();
        constants.insert(group.clone());
        constants.insert(name.clone());
        Self { group, name, constants }
    }

    /// `bindings` plus `CONFIGURATION` and `CONFIGURATION_GROUP`.
    pub fn bind(&self, bindings: &Bindings) -> Bindings {
        bindings
            .with(CONFIGURATION, self.name.clone())
            .with(CONFIGURATION_GROUP, self.group.clone())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.group, self.name)
    }
}

/// Configurations declared by the solution body, restricted to `filter`
/// when it is not empty.
fn configurations(body: &ObjectNode, filter: &[String]) -> Result<Vec<Configuration>> {
    let mut groups: IndexMap<&str, Vec<Configuration>> = IndexMap::new();
    for element in &body.children {
        let Element::ConfigurationGroup(group) = element else {
            continue;
        };
        if groups.contains_key(group.name.as_str()) {
            return Err(CompileError::Duplicate {
                kind: "configuration group",
                name: group.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        let mut configurations = Vec::new();
        for (name, constants) in &group.configs {
            if !seen.insert(name.as_str()) {
                return Err(CompileError::Duplicate {
                    kind: "configuration",
                    name: format!("{}|{name}", group.name),
                });
            }
            configurations.push(Configuration::new(group.name.clone(), name.clone(), constants.iter().cloned()));
        }
        groups.insert(&group.name, configurations);
    }

    for wanted in filter {
        if !groups.contains_key(wanted.as_str()) {
            return Err(CompileError::UnknownConfigurationGroup(wanted.clone()));
        }
    }

    let selected: Vec<Configuration> = groups
        .into_iter()
        .filter(|(name, _)| filter.is_empty() || filter.iter().any(|f| f.as_str() == *name))
        .flat_map(|(_, configurations)| configurations)
        .collect();
    if selected.is_empty() {
        return Err(CompileError::NoConfigurations);
    }
    Ok(selected)
}

/// The solution body: the single `solution` wrapper's children plus any
/// other top-level elements, or all top-level elements without a wrapper.
fn solution_body(document: &Document) -> Result<ObjectNode> {
    let mut wrapper: Option<&ObjectNode> = None;
    let mut rest = Vec::new();
    for element in &document.elements {
        match element {
            Element::Object(object) if object.object_type == SOLUTION => {
                if wrapper.is_some() {
                    return Err(CompileError::Duplicate { kind: SOLUTION, name: object.name.clone() });
                }
                if let Some(base) = &object.inherits {
                    return Err(CompileError::UnknownBase { object: object.heading(), base: base.clone() });
                }
                wrapper = Some(object);
            }
            other => rest.push(other.clone()),
        }
    }

    Ok(match wrapper {
        Some(wrapper) => {
            let mut body = wrapper.clone();
            body.children.extend(rest);
            body
        }
        None => ObjectNode {
            object_type: SOLUTION.to_string(),
            name: DEFAULT_NAME.to_string(),
            inherits: None,
            children: rest,
        },
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Solution
// ═══════════════════════════════════════════════════════════════════════════════

/// A fully resolved solution.
#[derive(Debug, Clone)]
pub struct Solution {
    pub name: String,
    pub configurations: Vec<Configuration>,
    /// Solution settings per configuration, fully expanded.
    pub settings: IndexMap<Configuration, Arc<Settings>>,
    pub templates: IndexMap<String, Template>,
    pub modules: IndexMap<String, Module>,
}

impl Solution {
    pub fn builder() -> SolutionBuilder {
        SolutionBuilder::new()
    }

    /// Resolve a document with default options.
    pub fn parse(source: &str) -> Result<Self> {
        SolutionBuilder::new().parse(source)
    }

    /// Load and resolve a document with default options. Source paths are
    /// resolved relative to the document's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        SolutionBuilder::new().from_file(path)
    }

    pub fn configuration(&self, group: &str, name: &str) -> Option<&Configuration> {
        self.configurations
            .iter()
            .find(|c| c.group == group && c.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn output_path(&self, configuration: &Configuration) -> Option<&str> {
        self.settings.get(configuration)?.text(OUTPUT_PATH)
    }

    /// Every project of `configuration`, in module order.
    pub fn projects<'s>(&'s self, configuration: &'s Configuration) -> impl Iterator<Item = &'s Project> + 's {
        self.modules.values().flat_map(move |module| module.projects(configuration))
    }

    pub fn project<'s>(&'s self, configuration: &'s Configuration, name: &str) -> Option<&'s Project> {
        self.projects(configuration).find(|p| p.name() == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves a solution with an external environment, extra defined
/// constants and a configuration-group filter.
///
/// ```no_run
/// use solconf_rs::SolutionBuilder;
///
/// let solution = SolutionBuilder::new()
///     .system_env()
///     .env_var("BUILD_NUMBER", "42")
///     .constant("CI")
///     .configuration_group("everything")
///     .from_file("example.solution")
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct SolutionBuilder {
    env: HashMap<String, String>,
    constants: BTreeSet<String>,
    groups: Vec<String>,
    search_root: Option<PathBuf>,
    matcher: Option<Box<dyn PatternMatcher>>,
}

impl SolutionBuilder {
    /// Create a new builder with an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a variable map into the environment. Later calls override
    /// earlier values for the same key.
    pub fn env(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Set a single environment variable.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Pull all current process environment variables into the map.
    pub fn system_env(mut self) -> Self {
        self.env.extend(std::env::vars());
        self
    }

    /// Define `constant` in every configuration.
    pub fn constant(mut self, constant: impl Into<String>) -> Self {
        self.constants.insert(constant.into());
        self
    }

    pub fn constants<I, S>(mut self, constants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constants.extend(constants.into_iter().map(Into::into));
        self
    }

    /// Resolve only the named configuration group. May be called more than
    /// once; without any call every group is resolved.
    pub fn configuration_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn configuration_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Directory that project source paths are relative to.
    pub fn search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_root = Some(root.into());
        self
    }

    /// Replace the file-system pattern matcher.
    pub fn matcher(mut self, matcher: impl PatternMatcher + 'static) -> Self {
        self.matcher = Some(Box::new(matcher));
        self
    }

    /// Parse and resolve a document.
    pub fn parse(self, source: &str) -> Result<Solution> {
        let document = Document::parse(source)?;
        self.resolve(&document)
    }

    /// Load, parse and resolve a document. The search root defaults to the
    /// document's directory.
    pub fn from_file(mut self, path: impl AsRef<Path>) -> Result<Solution> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        if self.search_root.is_none() {
            self.search_root = path.parent().map(Path::to_path_buf);
        }
        let document = Document::parse(&source).with_context(|| path.display().to_string())?;
        self.resolve(&document)
    }

    fn resolve(self, document: &Document) -> Result<Solution> {
        let body = solution_body(document)?;
        let configurations = configurations(&body, &self.groups)?;
        let bindings: Bindings = self.env.into_iter().collect();
        let bindings = bindings.with(SOLUTION_NAME, body.name.clone());
        let search_root = self.search_root.unwrap_or_else(|| PathBuf::from("."));
        let matcher: Box<dyn PatternMatcher> = self.matcher.unwrap_or_else(|| Box::new(FileSystemMatcher));
        let mut compiler = SettingsCompiler::new(self.constants);

        // ── Solution settings ──
        let mut settings = IndexMap::new();
        let mut whitelists = IndexMap::new();
        for configuration in &configurations {
            let scoped = configuration.bind(&bindings);
            let compiled = compiler.compile(
                &body,
                SOLUTION,
                Registry::for_context(Context::Solution),
                Some(configuration),
                None,
                &scoped,
            )?;
            let expanded = compiled
                .expanded(&scoped, Expansion::Final)
                .with_context(|| format!("{} [{configuration}]", body.heading()))?;
            whitelists.insert(configuration.clone(), Whitelist::new(&expanded.patterns(INCLUDE_PROJECTS))?);
            settings.insert(configuration.clone(), Arc::new(expanded));
        }

        // ── Templates, then modules ──
        let mut template_objects = Vec::new();
        let mut module_objects = Vec::new();
        for object in body.objects() {
            match object.object_type.as_str() {
                TEMPLATE => template_objects.push(object),
                MODULE => module_objects.push(object),
                _ => {
                    return Err(CompileError::UnexpectedObject {
                        found: object.object_type.clone(),
                        name: object.name.clone(),
                        parent: body.heading(),
                    });
                }
            }
        }

        let mut templates = IndexMap::new();
        for object in template_objects {
            if templates.contains_key(&object.name) {
                return Err(CompileError::Duplicate { kind: TEMPLATE, name: object.name.clone() });
            }
            let template = Template::resolve(object, &configurations, &mut compiler, &bindings)?;
            templates.insert(object.name.clone(), template);
        }

        let mut modules = IndexMap::new();
        let mut resolver = ModuleResolver {
            compiler: &mut compiler,
            matcher: matcher.as_ref(),
            search_root: &search_root,
            bindings: &bindings,
        };
        for object in module_objects {
            if modules.contains_key(&object.name) {
                return Err(CompileError::Duplicate { kind: MODULE, name: object.name.clone() });
            }
            let template_name = object
                .inherits
                .as_ref()
                .ok_or_else(|| CompileError::MissingTemplate(object.name.clone()))?;
            let template = templates
                .get(template_name)
                .ok_or_else(|| CompileError::UnknownTemplate(template_name.clone()))?;
            let module = resolver.resolve(object, template, &whitelists)?;
            modules.insert(object.name.clone(), module);
        }

        let solution = Solution {
            name: body.name.clone(),
            configurations,
            settings,
            templates,
            modules,
        };
        validate_projects(&solution, &whitelists)?;

        info!(
            solution = %solution.name,
            configurations = solution.configurations.len(),
            templates = solution.templates.len(),
            modules = solution.modules.len(),
            "resolved solution"
        );
        Ok(solution)
    }
}

/// Project names are unique per configuration, and with an active
/// whitelist every project reference names an included project.
fn validate_projects(solution: &Solution, whitelists: &IndexMap<Configuration, Whitelist>) -> Result<()> {
    for configuration in &solution.configurations {
        let mut included = HashSet::new();
        for project in solution.projects(configuration) {
            if !included.insert(project.name()) {
                return Err(CompileError::Duplicate { kind: "project", name: project.name().to_string() });
            }
        }

        if !whitelists.get(configuration).is_some_and(Whitelist::is_active) {
            continue;
        }
        for project in solution.projects(configuration) {
            for reference in &project.project_refs {
                if !included.contains(reference.as_str()) {
                    return Err(CompileError::InvalidProjectReference {
                        project: project.name().to_string(),
                        reference: reference.clone(),
                    })
                    .with_context(|| configuration.to_string());
                }
            }
        }
        debug!(%configuration, projects = included.len(), "validated project references");
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
