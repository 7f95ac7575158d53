//! Template resolution.
//!
//! A template is compiled once per configuration: its root body (project
//! declarations and commands) with the template registry, then each nested
//! `settings` object with the project-settings registry. Settings objects
//! inherit from each other inside one template; they are compiled in
//! dependency order regardless of declaration order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::ast::ObjectNode;
use crate::error::{CompileError, Result, ResultExt};
use crate::registry::{Context, Registry, names::PROJECTS};
use crate::settings::{Settings, SettingsCompiler};
use crate::solution::Configuration;
use crate::variables::{Bindings, TEMPLATE_NAME};

pub const SETTINGS: &str = "settings";

/// A template resolved for one configuration.
#[derive(Debug, Clone)]
pub struct TemplateConfiguration {
    /// The compiled template body.
    pub root: Arc<Settings>,
    /// `project name -> settings name`, as declared (partially expanded).
    pub projects: IndexMap<String, String>,
    /// Compiled settings objects, in declaration order.
    pub settings: IndexMap<String, Arc<Settings>>,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    /// Declared base of every settings object, used by modules that
    /// shadow one of them without naming a base.
    pub bases: IndexMap<String, Option<String>>,
    pub configurations: IndexMap<Configuration, TemplateConfiguration>,
}

impl Template {
    pub fn configuration(&self, configuration: &Configuration) -> Option<&TemplateConfiguration> {
        self.configurations.get(configuration)
    }

    /// Resolve `object` for every configuration.
    ///
    /// `bindings` must already carry the solution-level variables; the
    /// configuration and template names are bound here.
    pub fn resolve(
        object: &ObjectNode,
        configurations: &[Configuration],
        compiler: &mut SettingsCompiler,
        bindings: &Bindings,
    ) -> Result<Template> {
        let children = settings_objects(object)?;
        let bases = children
            .iter()
            .map(|child| (child.name.clone(), child.inherits.clone()))
            .collect();
        let scope = object.heading();

        let mut resolved = IndexMap::new();
        for configuration in configurations {
            let bindings = configuration.bind(bindings).with(TEMPLATE_NAME, object.name.clone());

            let root = compiler
                .compile(
                    object,
                    &scope,
                    Registry::for_context(Context::Template),
                    Some(configuration),
                    None,
                    &bindings,
                )?;
            let projects = project_declarations(&root);
            if projects.is_empty() && !root.is_excluded() {
                return Err(CompileError::MissingProjectDeclarations(object.name.clone()));
            }

            let pending = children
                .iter()
                .map(|child| (*child, child.inherits.clone()))
                .collect();
            let settings = compile_in_dependency_order(pending, &IndexMap::new(), |child, base| {
                compiler.compile(
                    child,
                    &scope,
                    Registry::for_context(Context::ProjectSettings),
                    Some(configuration),
                    base,
                    &bindings,
                )
            })
            .with_context(|| format!("{scope} [{configuration}]"))?;

            debug!(template = %object.name, %configuration, settings = settings.len(), "resolved template");
            resolved.insert(
                configuration.clone(),
                TemplateConfiguration { root, projects, settings },
            );
        }

        Ok(Template {
            name: object.name.clone(),
            bases,
            configurations: resolved,
        })
    }
}

/// `project -> settings` pairs declared by a compiled template or module
/// body.
pub(crate) fn project_declarations(root: &Settings) -> IndexMap<String, String> {
    root.dictionary(PROJECTS)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(project, item)| Some((project.clone(), item.as_text()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// The nested `settings` objects of a template or module, checked for
/// stray object types and duplicate names.
pub(crate) fn settings_objects(parent: &ObjectNode) -> Result<Vec<&ObjectNode>> {
    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for child in parent.objects() {
        if child.object_type != SETTINGS {
            return Err(CompileError::UnexpectedObject {
                found: child.object_type.clone(),
                name: child.name.clone(),
                parent: parent.heading(),
            });
        }
        if !seen.insert(child.name.as_str()) {
            return Err(CompileError::Duplicate { kind: SETTINGS, name: child.name.clone() });
        }
        children.push(child);
    }
    Ok(children)
}

/// Compile settings objects so that every base is compiled before the
/// objects that inherit from it.
///
/// Each pending entry pairs an object with its effective base name. A base
/// declared among the pending objects is waited for; any other base, and a
/// base naming the object itself, is taken from `inherited`. An object with
/// no base starts from the registry defaults, even when it shadows a
/// same-named entry of `inherited`. Returns the compiled settings in
/// `pending` order.
pub(crate) fn compile_in_dependency_order<'o, F>(
    pending: Vec<(&'o ObjectNode, Option<String>)>,
    inherited: &IndexMap<String, Arc<Settings>>,
    mut compile: F,
) -> Result<IndexMap<String, Arc<Settings>>>
where
    F: FnMut(&ObjectNode, Option<&Settings>) -> Result<Arc<Settings>>,
{
    let local: HashSet<String> = pending.iter().map(|(object, _)| object.name.clone()).collect();
    let is_local = |object: &ObjectNode, base: &str| base != object.name && local.contains(base);
    for (object, base) in &pending {
        if let Some(base) = base {
            if !is_local(object, base) && !inherited.contains_key(base) {
                return Err(CompileError::UnknownBase { object: object.heading(), base: base.clone() });
            }
        }
    }

    let order: Vec<String> = pending.iter().map(|(object, _)| object.name.clone()).collect();
    let mut compiled: HashMap<String, Arc<Settings>> = HashMap::new();
    let mut remaining = pending;

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut waiting = Vec::new();

        for (object, base) in remaining {
            let base_settings = match &base {
                None => None,
                Some(name) if is_local(object, name) => match compiled.get(name) {
                    Some(settings) => Some(Arc::clone(settings)),
                    None => {
                        waiting.push((object, base));
                        continue;
                    }
                },
                Some(name) => inherited.get(name).cloned(),
            };
            let settings = compile(object, base_settings.as_deref())?;
            compiled.insert(object.name.clone(), settings);
        }

        if waiting.len() == before {
            let stuck = waiting.iter().map(|(object, _)| object.name.clone()).collect();
            return Err(CompileError::CyclicInheritance(stuck));
        }
        remaining = waiting;
    }

    Ok(order
        .into_iter()
        .filter_map(|name| compiled.remove(&name).map(|settings| (name, settings)))
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
