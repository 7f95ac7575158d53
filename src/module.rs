//! Module resolution.
//!
//! A module applies one template: `module Core : Library { ... }`. Its body
//! may override the template's project declarations and commands, and may
//! declare `settings` objects that shadow the template's settings of the
//! same name for this module only. A shadowing object that names no base
//! keeps the base the template declared for that name; one that names
//! itself (`settings Code : Code`) extends the template's object.
//!
//! Every declared project becomes one [`Project`] per configuration unless
//! its settings exclude it or the solution whitelist does not admit it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;
use uuid::Uuid;

use crate::ast::ObjectNode;
use crate::error::{CompileError, Result, ResultExt};
use crate::matcher::{PatternMatcher, Whitelist};
use crate::registry::{Context, Registry, names::*};
use crate::settings::{Settings, SettingsCompiler};
use crate::solution::Configuration;
use crate::template::{Template, compile_in_dependency_order, project_declarations, settings_objects};
use crate::variables::{Bindings, Expansion, MODULE_NAME, PROJECT_NAME, TEMPLATE_NAME};

// ═══════════════════════════════════════════════════════════════════════════════
//  Model
// ═══════════════════════════════════════════════════════════════════════════════

/// What stays the same for a project across all configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub name: String,
    pub guid: Uuid,
    pub source_path: PathBuf,
}

/// One project of one module under one configuration.
#[derive(Debug, Clone)]
pub struct Project {
    pub identity: Arc<ProjectIdentity>,
    pub module: String,
    pub configuration: Configuration,
    /// Fully expanded settings.
    pub settings: Arc<Settings>,
    /// Matched source files, relative to the project's source path.
    pub include_files: BTreeSet<PathBuf>,
    pub lib_refs: Vec<String>,
    pub project_refs: Vec<String>,
}

impl Project {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn guid(&self) -> Uuid {
        self.identity.guid
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub template: String,
    /// Projects per configuration, in declaration order. An excluded module
    /// has an empty map for the configurations it is excluded from.
    pub configurations: IndexMap<Configuration, IndexMap<String, Project>>,
}

impl Module {
    pub fn projects(&self, configuration: &Configuration) -> impl Iterator<Item = &Project> {
        self.configurations
            .get(configuration)
            .into_iter()
            .flat_map(|projects| projects.values())
    }

    pub fn project(&self, configuration: &Configuration, name: &str) -> Option<&Project> {
        self.configurations.get(configuration)?.get(name)
    }
}

/// Stable GUID for a project that does not declare one.
pub fn generated_guid(module: &str, project: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{module}/{project}").as_bytes())
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared inputs for resolving the modules of one solution.
pub struct ModuleResolver<'a> {
    pub compiler: &'a mut SettingsCompiler,
    pub matcher: &'a dyn PatternMatcher,
    pub search_root: &'a Path,
    /// Solution-level bindings (external environment and solution name).
    pub bindings: &'a Bindings,
}

impl ModuleResolver<'_> {
    /// Resolve `object` against `template` for every configuration the
    /// template was resolved for.
    pub fn resolve(
        &mut self,
        object: &ObjectNode,
        template: &Template,
        whitelists: &IndexMap<Configuration, Whitelist>,
    ) -> Result<Module> {
        let children = settings_objects(object)?;
        let scope = object.heading();
        let mut identities: HashMap<String, Arc<ProjectIdentity>> = HashMap::new();
        let mut configurations = IndexMap::new();

        for (configuration, resolved) in &template.configurations {
            let bindings = configuration
                .bind(self.bindings)
                .with(TEMPLATE_NAME, template.name.clone())
                .with(MODULE_NAME, object.name.clone());

            let root = self
                .compiler
                .compile(
                    object,
                    &scope,
                    Registry::for_context(Context::Template),
                    Some(configuration),
                    Some(&resolved.root),
                    &bindings,
                )?;
            if root.is_excluded() {
                debug!(module = %object.name, %configuration, "module excluded");
                configurations.insert(configuration.clone(), IndexMap::new());
                continue;
            }

            // ── Settings: module objects shadow the template's ──
            let pending = children
                .iter()
                .map(|child| {
                    let base = child
                        .inherits
                        .clone()
                        .or_else(|| template.bases.get(&child.name).cloned().flatten());
                    (*child, base)
                })
                .collect();
            let compiler = &mut *self.compiler;
            let local = compile_in_dependency_order(pending, &resolved.settings, |child, base| {
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
            let mut settings = resolved.settings.clone();
            settings.extend(local);

            // ── Projects ──
            let whitelist = whitelists.get(configuration);
            let mut projects = IndexMap::new();
            for (declared, settings_name) in project_declarations(&root) {
                let name = bindings.expand(&declared, Expansion::Final)?;
                let settings_name = bindings.expand(&settings_name, Expansion::Final)?;
                let context = || format!("project {name} [{configuration}]");

                let compiled = settings.get(&settings_name).ok_or_else(|| CompileError::UnknownSettings {
                    project: name.clone(),
                    settings: settings_name.clone(),
                })?;
                let project_bindings = bindings.with(PROJECT_NAME, name.clone());
                let expanded = compiled
                    .expanded(&project_bindings, Expansion::Final)
                    .with_context(context)?;

                if expanded.is_excluded() {
                    debug!(project = %name, %configuration, "project excluded");
                    continue;
                }
                if whitelist.is_some_and(|w| !w.allows(&name)) {
                    debug!(project = %name, %configuration, "project not in whitelist");
                    continue;
                }

                let identity = identity(&object.name, &name, &expanded).with_context(context)?;
                let identity = match identities.get(&name) {
                    Some(known) => {
                        check_consistent(known, &identity, configuration)?;
                        Arc::clone(known)
                    }
                    None => {
                        let identity = Arc::new(identity);
                        identities.insert(name.clone(), Arc::clone(&identity));
                        identity
                    }
                };

                let include_files = self
                    .matcher
                    .matches(
                        &expanded.patterns(INCLUDE_FILES),
                        &expanded.patterns(EXCLUDE_FILES),
                        &self.search_root.join(&identity.source_path),
                    )
                    .with_context(context)?;
                let lib_refs = expanded.texts(LIB_REFS).into_iter().map(String::from).collect();
                let project_refs = expanded.texts(PROJECT_REFS).into_iter().map(String::from).collect();

                let project = Project {
                    identity,
                    module: object.name.clone(),
                    configuration: configuration.clone(),
                    settings: Arc::new(expanded),
                    include_files,
                    lib_refs,
                    project_refs,
                };
                if projects.insert(name.clone(), project).is_some() {
                    return Err(CompileError::Duplicate { kind: "project", name });
                }
            }

            debug!(module = %object.name, %configuration, projects = projects.len(), "resolved module");
            configurations.insert(configuration.clone(), projects);
        }

        Ok(Module {
            name: object.name.clone(),
            template: template.name.clone(),
            configurations,
        })
    }
}

fn identity(module: &str, project: &str, settings: &Settings) -> Result<ProjectIdentity> {
    let guid = match settings.text(PROJECT_GUID) {
        Some(text) => Uuid::parse_str(text.trim_matches(|c| c == '{' || c == '}'))
            .map_err(|_| CompileError::InvalidGuid(text.to_string()))?,
        None => generated_guid(module, project),
    };
    let source_path = PathBuf::from(settings.text(SOURCE_PATH).unwrap_or(module));
    Ok(ProjectIdentity { name: project.to_string(), guid, source_path })
}

fn check_consistent(
    known: &ProjectIdentity,
    current: &ProjectIdentity,
    configuration: &Configuration,
) -> Result<()> {
    let field = if known.guid != current.guid {
        "guid"
    } else if known.source_path != current.source_path {
        "source path"
    } else {
        return Ok(());
    };
    Err(CompileError::InconsistentProjectIdentity {
        project: known.name.clone(),
        field,
        configuration: configuration.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Document;
    use crate::matcher::{FileSystemMatcher, Pattern};
    use std::fs;

    const LIBRARY: &str = r#"
        template Library {
            add projects [$(MODULE_NAME): Code, "$(MODULE_NAME).Tests": Tests]
            settings Common {
                set target framework: net8.0
                if (DEBUG) add defines: DEBUG
            }
            settings Code : Common {
                add include files: glob "*.cs"
                add exclude files: regex "Tests/"
            }
            settings Tests : Common {
                set source path: "$(MODULE_NAME)/Tests"
                add include files: glob "*.cs"
                add project refs: "$(MODULE_NAME)"
            }
        }
    "#;

    fn configurations() -> Vec<Configuration> {
        vec![
            Configuration::new("everything", "Debug", ["DEBUG"]),
            Configuration::new("everything", "Release", ["RELEASE"]),
        ]
    }

    fn resolve_in(root: &Path, module: &str, whitelist: Option<Whitelist>) -> Result<Module> {
        let template_doc = Document::parse(LIBRARY).unwrap();
        let module_doc = Document::parse(module).unwrap();
        let bindings = Bindings::new();
        let mut compiler = SettingsCompiler::default();
        let template = Template::resolve(
            template_doc.objects().next().unwrap(),
            &configurations(),
            &mut compiler,
            &bindings,
        )?;
        let whitelists = match whitelist {
            Some(w) => configurations().into_iter().map(|c| (c, w.clone())).collect(),
            None => IndexMap::new(),
        };
        let mut resolver = ModuleResolver {
            compiler: &mut compiler,
            matcher: &FileSystemMatcher,
            search_root: root,
            bindings: &bindings,
        };
        resolver.resolve(module_doc.objects().next().unwrap(), &template, &whitelists)
    }

    fn resolve(module: &str) -> Result<Module> {
        resolve_in(Path::new("does-not-exist"), module, None)
    }

    fn debug() -> Configuration {
        configurations().remove(0)
    }

    #[test]
    fn projects_are_materialised_per_configuration() {
        let module = resolve("module Core : Library { }").unwrap();
        assert_eq!(module.template, "Library");
        for configuration in configurations() {
            let names: Vec<_> = module.projects(&configuration).map(Project::name).collect();
            assert_eq!(names, ["Core", "Core.Tests"]);
        }

        let tests = module.project(&debug(), "Core.Tests").unwrap();
        assert_eq!(tests.identity.source_path, PathBuf::from("Core/Tests"));
        assert_eq!(tests.project_refs, ["Core"]);
        assert_eq!(tests.settings.texts(DEFINES), ["DEBUG"]);
        assert_eq!(tests.settings.text(TARGET_FRAMEWORK), Some("net8.0"));
    }

    #[test]
    fn identity_is_shared_across_configurations() {
        let module = resolve("module Core : Library { }").unwrap();
        let configurations = configurations();
        let debug = module.project(&configurations[0], "Core").unwrap();
        let release = module.project(&configurations[1], "Core").unwrap();
        assert!(Arc::ptr_eq(&debug.identity, &release.identity));
        assert_eq!(debug.guid(), generated_guid("Core", "Core"));
        assert_ne!(debug.guid(), generated_guid("Other", "Core"));
    }

    #[test]
    fn explicit_guid_is_validated() {
        let module = resolve(
            r#"module Core : Library {
                settings Code : Common { set project guid: "{8F2B6C1E-3D4A-4B5C-9E8F-1A2B3C4D5E6F}" }
            }"#,
        )
        .unwrap();
        let project = module.project(&debug(), "Core").unwrap();
        assert_eq!(project.guid().to_string(), "8f2b6c1e-3d4a-4b5c-9e8f-1a2b3c4d5e6f");

        let err = resolve(r#"module Core : Library { settings Code { set project guid: nonsense } }"#)
            .unwrap_err();
        assert!(matches!(err.root(), CompileError::InvalidGuid(text) if text == "nonsense"));
    }

    #[test]
    fn guid_differing_between_configurations_is_rejected() {
        let err = resolve(
            r#"module Core : Library {
                settings Code {
                    if (DEBUG) set project guid: "8f2b6c1e-3d4a-4b5c-9e8f-1a2b3c4d5e6f"
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(
            err.root(),
            CompileError::InconsistentProjectIdentity { field: "guid", .. }
        ));
    }

    #[test]
    fn module_settings_shadow_template_settings() {
        let module = resolve(
            r#"module Core : Library {
                settings Code { add defines: CORE }
            }"#,
        )
        .unwrap();
        // Shadowing `Code` keeps the template's base `Common`.
        let code = module.project(&debug(), "Core").unwrap();
        assert_eq!(code.settings.texts(DEFINES), ["DEBUG", "CORE"]);
        assert!(code.settings.patterns(INCLUDE_FILES).is_empty());

        let tests = module.project(&debug(), "Core.Tests").unwrap();
        assert_eq!(tests.settings.texts(DEFINES), ["DEBUG"]);
    }

    #[test]
    fn shadowing_an_unbased_template_settings_starts_from_defaults() {
        let module = resolve(
            r#"module Core : Library {
                set projects: Core: Common
                settings Common { add defines: CORE }
            }"#,
        )
        .unwrap();
        let common = module.project(&debug(), "Core").unwrap();
        assert_eq!(common.settings.texts(DEFINES), ["CORE"]);
        assert_eq!(common.settings.text(TARGET_FRAMEWORK), None);
    }

    #[test]
    fn shadowed_base_is_used_by_a_shadowing_child() {
        let module = resolve(
            r#"module Core : Library {
                settings Common { add defines: CORE_COMMON }
                settings Code { add defines: CORE_CODE }
            }"#,
        )
        .unwrap();
        let code = module.project(&debug(), "Core").unwrap();
        assert_eq!(code.settings.texts(DEFINES), ["CORE_COMMON", "CORE_CODE"]);
        // `Tests` is not shadowed and keeps the template's compiled settings.
        let tests = module.project(&debug(), "Core.Tests").unwrap();
        assert_eq!(tests.settings.texts(DEFINES), ["DEBUG"]);
    }

    #[test]
    fn self_named_base_extends_the_template_settings() {
        let module = resolve(
            r#"module Core : Library {
                settings Code : Code { add lib refs: System.Text.Json }
            }"#,
        )
        .unwrap();
        let code = module.project(&debug(), "Core").unwrap();
        assert_eq!(code.lib_refs, ["System.Text.Json"]);
        assert_eq!(code.settings.patterns(INCLUDE_FILES), [Pattern::glob("*.cs")]);
    }

    #[test]
    fn module_body_overrides_project_declarations() {
        let module = resolve("module Tools : Library { set projects: Tools: Code }").unwrap();
        let names: Vec<_> = module.projects(&debug()).map(Project::name).collect();
        assert_eq!(names, ["Tools"]);
    }

    #[test]
    fn excluded_projects_and_modules_are_skipped() {
        let module = resolve(
            r#"module Core : Library {
                settings Tests : Common { if (RELEASE) exclude }
            }"#,
        )
        .unwrap();
        let configurations = configurations();
        assert_eq!(module.projects(&configurations[0]).count(), 2);
        let release: Vec<_> = module.projects(&configurations[1]).map(Project::name).collect();
        assert_eq!(release, ["Core"]);

        let module = resolve("module Core : Library { if (RELEASE) exclude }").unwrap();
        assert_eq!(module.projects(&configurations[1]).count(), 0);
        assert_eq!(module.projects(&configurations[0]).count(), 2);
    }

    #[test]
    fn whitelist_filters_projects() {
        let whitelist = Whitelist::new(&[Pattern::glob("*.Tests")]).unwrap();
        let module = resolve_in(Path::new("."), "module Core : Library { }", Some(whitelist)).unwrap();
        let names: Vec<_> = module.projects(&debug()).map(Project::name).collect();
        assert_eq!(names, ["Core.Tests"]);
    }

    #[test]
    fn unknown_settings_binding_is_rejected() {
        let err = resolve("module Core : Library { set projects: Core: Missing }").unwrap_err();
        assert!(matches!(
            err.root(),
            CompileError::UnknownSettings { project, settings } if project == "Core" && settings == "Missing"
        ));
    }

    #[test]
    fn include_files_come_from_the_matcher() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Core/Tests")).unwrap();
        for file in ["Core/Program.cs", "Core/Tests/ProgramTests.cs", "Core/notes.txt"] {
            fs::write(dir.path().join(file), "").unwrap();
        }

        let module = resolve_in(dir.path(), "module Core : Library { }", None).unwrap();
        let code = module.project(&debug(), "Core").unwrap();
        assert_eq!(code.include_files, BTreeSet::from([PathBuf::from("Program.cs")]));
        let tests = module.project(&debug(), "Core.Tests").unwrap();
        assert_eq!(tests.include_files, BTreeSet::from([PathBuf::from("ProgramTests.cs")]));
    }
}
