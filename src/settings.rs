//! Settings compilation.
//!
//! A settings object is compiled by walking its children against the
//! registry of its context:
//!
//! 1. seed a [`PropertyBag`] from the base [`Settings`] (cloned) or from the
//!    registry defaults;
//! 2. walk the children in document order, descending into conditional
//!    blocks whose conditional holds and skipping the rest;
//! 3. merge every property whose conditional holds, run every command whose
//!    conditional holds, and stop early when a command terminates the walk;
//! 4. expand `$(NAME)` references partially with the active bindings;
//! 5. freeze the bag into an immutable [`Settings`].
//!
//! Compiled settings are cached by [`SettingsKey`] and shared as
//! `Arc<Settings>`, so each key compiles at most once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::ast::{Action, Element, ObjectNode, Value};
use crate::condition;
use crate::error::{CompileError, Result, ResultExt};
use crate::matcher::Pattern;
use crate::registry::{Context, Flow, PropertyDefinition, Registry};
use crate::solution::Configuration;
use crate::variables::{Bindings, Expansion};

// ═══════════════════════════════════════════════════════════════════════════════
//  Values
// ═══════════════════════════════════════════════════════════════════════════════

/// One item of a property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Item {
    Text(String),
    Pattern(Pattern),
    Xml(String),
}

impl Item {
    /// Text of a text or xml item.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(text) | Item::Xml(text) => Some(text),
            Item::Pattern(_) => None,
        }
    }

    pub fn as_pattern(&self) -> Option<&Pattern> {
        match self {
            Item::Pattern(pattern) => Some(pattern),
            _ => None,
        }
    }

    fn expand(&self, bindings: &Bindings, mode: Expansion) -> Result<Item> {
        Ok(match self {
            Item::Text(text) => Item::Text(bindings.expand(text, mode)?),
            Item::Xml(text) => Item::Xml(bindings.expand(text, mode)?),
            Item::Pattern(pattern) => Item::Pattern(pattern.with_text(bindings.expand(&pattern.text, mode)?)),
        })
    }
}

/// The native value of one property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(Option<Item>),
    Set(IndexSet<Item>),
    Dictionary(IndexMap<String, Item>),
}

impl PropertyValue {
    fn expand(&self, bindings: &Bindings, mode: Expansion) -> Result<PropertyValue> {
        Ok(match self {
            PropertyValue::Scalar(item) => {
                PropertyValue::Scalar(item.as_ref().map(|i| i.expand(bindings, mode)).transpose()?)
            }
            PropertyValue::Set(items) => PropertyValue::Set(
                items
                    .iter()
                    .map(|i| i.expand(bindings, mode))
                    .collect::<Result<_>>()?,
            ),
            PropertyValue::Dictionary(entries) => PropertyValue::Dictionary(
                entries
                    .iter()
                    .map(|(k, i)| Ok((bindings.expand(k, mode)?, i.expand(bindings, mode)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Property bag
// ═══════════════════════════════════════════════════════════════════════════════

/// The mutable working state of one settings compile.
#[derive(Debug, Clone)]
pub struct PropertyBag {
    context: Context,
    values: IndexMap<&'static str, PropertyValue>,
    excluded: bool,
}

impl PropertyBag {
    /// Every registered property at its default value.
    pub fn defaults(registry: &Registry) -> Self {
        Self {
            context: registry.context(),
            values: registry.properties().map(|p| (p.name, p.default_value())).collect(),
            excluded: false,
        }
    }

    /// A working copy of compiled settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            context: settings.context,
            values: settings.values.clone(),
            excluded: settings.excluded,
        }
    }

    /// Read `value` and merge it into the property named by `definition`.
    pub fn apply(&mut self, definition: &PropertyDefinition, action: Action, value: &Value) -> Result<()> {
        let incoming = definition.read(value)?;
        let current = self
            .values
            .entry(definition.name)
            .or_insert_with(|| definition.default_value());
        definition.merge(current, action, incoming)
    }

    pub fn exclude(&mut self) {
        self.excluded = true;
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    fn expand(&mut self, bindings: &Bindings, mode: Expansion) -> Result<()> {
        for (name, value) in self.values.iter_mut() {
            *value = value.expand(bindings, mode).with_context(|| format!("property '{name}'"))?;
        }
        Ok(())
    }

    fn freeze(self, key: SettingsKey) -> Settings {
        Settings {
            key,
            context: self.context,
            values: self.values,
            excluded: self.excluded,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifies one compile of one settings object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsKey {
    /// Owning object, e.g. `template Library` or `module Core`.
    pub scope: String,
    /// Object type, so a root body and a same-named child never collide.
    pub object_type: String,
    pub name: String,
    pub configuration: Option<Configuration>,
    /// External constants active during the compile.
    pub constants: BTreeSet<String>,
}

/// The resolved, immutable property bag of one settings object under one
/// configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    key: SettingsKey,
    context: Context,
    values: IndexMap<&'static str, PropertyValue>,
    excluded: bool,
}

impl Settings {
    pub fn key(&self) -> &SettingsKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// Set by the `exclude` command.
    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Text of a scalar property, if set.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(PropertyValue::Scalar(Some(item))) => item.as_text(),
            _ => None,
        }
    }

    /// Items of a set property, in merge order.
    pub fn items(&self, name: &str) -> impl Iterator<Item = &Item> {
        let items = match self.values.get(name) {
            Some(PropertyValue::Set(items)) => Some(items.iter()),
            _ => None,
        };
        items.into_iter().flatten()
    }

    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.items(name).filter_map(Item::as_text).collect()
    }

    pub fn patterns(&self, name: &str) -> Vec<Pattern> {
        self.items(name).filter_map(Item::as_pattern).cloned().collect()
    }

    pub fn dictionary(&self, name: &str) -> Option<&IndexMap<String, Item>> {
        match self.values.get(name) {
            Some(PropertyValue::Dictionary(entries)) => Some(entries),
            _ => None,
        }
    }

    /// A copy with every value expanded against `bindings`.
    pub fn expanded(&self, bindings: &Bindings, mode: Expansion) -> Result<Settings> {
        let mut bag = PropertyBag::from_settings(self);
        bag.expand(bindings, mode)?;
        Ok(bag.freeze(self.key.clone()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// At-most-once store of compiled settings.
#[derive(Debug, Default)]
pub struct SettingsCache {
    entries: HashMap<SettingsKey, Arc<Settings>>,
}

impl SettingsCache {
    /// Return the cached settings for `key`, compiling them with `compile`
    /// on a miss. A failed compile caches nothing.
    pub fn get_or_compile<F>(&mut self, key: SettingsKey, compile: F) -> Result<Arc<Settings>>
    where
        F: FnOnce(SettingsKey) -> Result<Settings>,
    {
        if let Some(hit) = self.entries.get(&key) {
            debug!(scope = %key.scope, settings = %key.name, "settings cache hit");
            return Ok(Arc::clone(hit));
        }
        let settings = Arc::new(compile(key.clone())?);
        self.entries.insert(key, Arc::clone(&settings));
        Ok(settings)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Compiler
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles settings objects, caching the results.
#[derive(Debug, Default)]
pub struct SettingsCompiler {
    constants: BTreeSet<String>,
    cache: SettingsCache,
}

impl SettingsCompiler {
    /// `constants` are defined in every configuration, in addition to the
    /// configuration's own.
    pub fn new(constants: BTreeSet<String>) -> Self {
        Self { constants, cache: SettingsCache::default() }
    }

    pub fn cache(&self) -> &SettingsCache {
        &self.cache
    }

    /// Compile `object` in `scope` under `configuration`.
    ///
    /// `base` must be the compiled settings named by `object.inherits` when
    /// the object declares one. An object without a declared base may still
    /// be handed a base by the resolver (module roots and shadowing
    /// settings).
    pub fn compile(
        &mut self,
        object: &ObjectNode,
        scope: &str,
        registry: &Registry,
        configuration: Option<&Configuration>,
        base: Option<&Settings>,
        bindings: &Bindings,
    ) -> Result<Arc<Settings>> {
        if let Some(declared) = &object.inherits {
            if !base.is_some_and(|b| b.name() == declared) {
                return Err(CompileError::BaseNotCompiled {
                    object: object.heading(),
                    base: declared.clone(),
                });
            }
        }

        let key = SettingsKey {
            scope: scope.to_string(),
            object_type: object.object_type.clone(),
            name: object.name.clone(),
            configuration: configuration.cloned(),
            constants: self.constants.clone(),
        };
        let mut constants = self.constants.clone();
        if let Some(configuration) = configuration {
            constants.extend(configuration.constants.iter().cloned());
        }

        self.cache
            .get_or_compile(key, |key| {
                let mut bag = match base {
                    Some(base) => PropertyBag::from_settings(base),
                    None => PropertyBag::defaults(registry),
                };
                walk(&object.children, registry, &constants, &mut bag)?;
                bag.expand(bindings, Expansion::Partial)?;
                trace!(scope = %key.scope, settings = %key.name, "compiled settings");
                Ok(bag.freeze(key))
            })
            .with_context(|| match configuration {
                Some(configuration) => format!("{} [{configuration}]", object.heading()),
                None => object.heading(),
            })
    }
}

/// Apply `elements` to `bag`. Conditional blocks are transparent: a block
/// that holds contributes its children in place.
fn walk(
    elements: &[Element],
    registry: &Registry,
    constants: &BTreeSet<String>,
    bag: &mut PropertyBag,
) -> Result<Flow> {
    for element in elements {
        match element {
            Element::ConditionalBlock(block) => {
                if condition::compile(&block.conditional, constants)?
                    && walk(&block.children, registry, constants, bag)? == Flow::Terminate
                {
                    return Ok(Flow::Terminate);
                }
            }
            Element::Property(property) => {
                if !condition::compile(&property.conditional, constants)? {
                    trace!(property = %property.full_name(), "conditional is false, skipped");
                    continue;
                }
                let definition = registry.property(&property.full_name())?;
                bag.apply(definition, property.action, &property.value)?;
            }
            Element::Command(command) => {
                if !condition::compile(&command.conditional, constants)? {
                    continue;
                }
                let definition = registry.command(&command.name)?;
                if (definition.action)(bag, command.argument.as_deref())? == Flow::Terminate {
                    trace!(command = %command.name, "walk terminated");
                    return Ok(Flow::Terminate);
                }
            }
            // Nested objects are compiled by their own resolver.
            Element::Object(_) | Element::ConfigurationGroup(_) | Element::Comment(_) => {}
        }
    }
    Ok(Flow::Continue)
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Document;
    use crate::registry::names::*;
    use crate::variables::MODULE_NAME;

    fn settings_object(body: &str) -> ObjectNode {
        let source = format!("settings Core {{\n{body}\n}}");
        let doc = Document::parse(&source).unwrap();
        doc.objects().next().unwrap().clone()
    }

    fn debug() -> Configuration {
        Configuration::new("everything", "Debug", ["DEBUG"])
    }

    fn compile(body: &str) -> Result<Arc<Settings>> {
        compile_with(body, None)
    }

    fn compile_with(body: &str, base: Option<&Settings>) -> Result<Arc<Settings>> {
        let object = settings_object(body);
        SettingsCompiler::default().compile(
            &object,
            "template Library",
            Registry::for_context(Context::ProjectSettings),
            Some(&debug()),
            base,
            &Bindings::new().with(MODULE_NAME, "Core"),
        )
    }

    #[test]
    fn defaults_seed_an_empty_object() {
        let settings = compile("").unwrap();
        assert_eq!(settings.text(OUTPUT_TYPE), Some("Library"));
        assert_eq!(settings.text(SOURCE_PATH), Some("Core"));
        assert_eq!(settings.text(TARGET_FRAMEWORK), None);
        assert!(settings.texts(LIB_REFS).is_empty());
        assert!(!settings.is_excluded());
    }

    #[test]
    fn array_merge_follows_set_and_add() {
        let settings = compile("add lib refs [A, B]\nadd lib refs [C]").unwrap();
        assert_eq!(settings.texts(LIB_REFS), ["A", "B", "C"]);

        let settings = compile("add lib refs [A]\nset lib refs [X]\nadd lib refs [Y, X]").unwrap();
        assert_eq!(settings.texts(LIB_REFS), ["X", "Y"]);
    }

    #[test]
    fn add_on_scalar_fails_with_context() {
        let err = compile("add target framework: v5").unwrap_err();
        assert!(matches!(err.root(), CompileError::InvalidAction(name) if name == TARGET_FRAMEWORK));
        assert!(err.to_string().starts_with("settings Core [everything|Debug]: "), "{err}");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = compile("set colour: blue").unwrap_err();
        assert!(matches!(err.root(), CompileError::UnrecognizedProperty(name) if name == "colour"));
        let err = compile("launch").unwrap_err();
        assert!(matches!(err.root(), CompileError::UnrecognizedCommand(name) if name == "launch"));
    }

    #[test]
    fn conditionals_filter_properties_and_blocks() {
        let settings = compile(
            r#"
            if (DEBUG) add defines: "DEBUG"
            if (!DEBUG) add defines: "NDEBUG"
            if (everything && Debug) {
                add defines: "TRACE"
                if (RELEASE) { add defines: "NEVER" }
            }
            if (false) { error "unreachable" }
            "#,
        )
        .unwrap();
        assert_eq!(settings.texts(DEFINES), ["DEBUG", "TRACE"]);
    }

    #[test]
    fn false_properties_are_not_validated() {
        // The property is skipped before its name is looked up.
        let settings = compile("if (RELEASE) set colour: blue").unwrap();
        assert!(settings.value("colour").is_none());
    }

    #[test]
    fn skip_stops_the_walk_for_this_object_only() {
        let settings = compile("add defines: A\nif (DEBUG) { skip }\nadd defines: B").unwrap();
        assert_eq!(settings.texts(DEFINES), ["A"]);
        assert!(!settings.is_excluded());
    }

    #[test]
    fn exclude_marks_and_stops() {
        let settings = compile("exclude\nerror \"not reached\"").unwrap();
        assert!(settings.is_excluded());
    }

    #[test]
    fn error_command_fails_the_compile() {
        let err = compile("error \"unsupported platform\"").unwrap_err();
        assert!(matches!(err.root(), CompileError::User(message) if message == "unsupported platform"));
    }

    #[test]
    fn base_values_are_inherited_and_not_aliased() {
        let base = compile("add lib refs [A]\nset target framework: v4").unwrap();
        let object = {
            let mut object = settings_object("add lib refs [B]");
            object.name = "Child".into();
            object.inherits = Some("Core".into());
            object
        };
        let child = SettingsCompiler::default()
            .compile(
                &object,
                "template Library",
                Registry::for_context(Context::ProjectSettings),
                Some(&debug()),
                Some(&base),
                &Bindings::new(),
            )
            .unwrap();
        assert_eq!(child.texts(LIB_REFS), ["A", "B"]);
        assert_eq!(child.text(TARGET_FRAMEWORK), Some("v4"));
        assert_eq!(base.texts(LIB_REFS), ["A"]);
    }

    #[test]
    fn declared_base_must_be_compiled() {
        let mut object = settings_object("");
        object.inherits = Some("Common".into());
        let err = compile_with_object(&object, None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::BaseNotCompiled { ref base, .. } if base == "Common"
        ));

        let other = compile("").unwrap();
        let err = compile_with_object(&object, Some(&other)).unwrap_err();
        assert!(matches!(err, CompileError::BaseNotCompiled { .. }));
    }

    fn compile_with_object(object: &ObjectNode, base: Option<&Settings>) -> Result<Arc<Settings>> {
        SettingsCompiler::default().compile(
            object,
            "template Library",
            Registry::for_context(Context::ProjectSettings),
            Some(&debug()),
            base,
            &Bindings::new(),
        )
    }

    #[test]
    fn expansion_is_partial_then_final() {
        let settings = compile(r#"set assembly name: "$(MODULE_NAME).$(PROJECT_NAME)""#).unwrap();
        assert_eq!(settings.text(ASSEMBLY_NAME), Some("Core.$(PROJECT_NAME)"));

        let bindings = Bindings::new().with("PROJECT_NAME", "Core.Tests");
        let last = settings.expanded(&bindings, Expansion::Final).unwrap();
        assert_eq!(last.text(ASSEMBLY_NAME), Some("Core.Core.Tests"));

        let err = settings.expanded(&Bindings::new(), Expansion::Final).unwrap_err();
        assert!(matches!(err.root(), CompileError::UnboundVariable(name) if name == "PROJECT_NAME"));
    }

    #[test]
    fn patterns_and_dictionaries_expand() {
        let settings = compile(
            r#"
            add include files [glob "$(MODULE_NAME)/*.cs", !regex "Generated"]
            add properties [LangVersion: latest, "Product": "$(MODULE_NAME)"]
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.patterns(INCLUDE_FILES),
            [Pattern::glob("Core/*.cs"), Pattern::regex("Generated").negate()]
        );
        let properties = settings.dictionary(PROPERTIES).unwrap();
        assert_eq!(properties["LangVersion"], Item::Text("latest".into()));
        assert_eq!(properties["Product"], Item::Text("Core".into()));
    }

    #[test]
    fn cache_compiles_each_key_once() {
        let object = settings_object("add defines: A");
        let registry = Registry::for_context(Context::ProjectSettings);
        let mut compiler = SettingsCompiler::default();
        let bindings = Bindings::new();

        let first = compiler
            .compile(&object, "template Library", registry, Some(&debug()), None, &bindings)
            .unwrap();
        let second = compiler
            .compile(&object, "template Library", registry, Some(&debug()), None, &bindings)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let release = Configuration::new("everything", "Release", ["RELEASE"]);
        compiler
            .compile(&object, "template Library", registry, Some(&release), None, &bindings)
            .unwrap();
        assert_eq!(compiler.cache().len(), 2);
    }

    #[test]
    fn external_constants_are_defined() {
        let object = settings_object("if (CI) add defines: CI");
        let mut compiler = SettingsCompiler::new(BTreeSet::from(["CI".to_string()]));
        let settings = compiler
            .compile(
                &object,
                "template Library",
                Registry::for_context(Context::ProjectSettings),
                Some(&debug()),
                None,
                &Bindings::new(),
            )
            .unwrap();
        assert_eq!(settings.texts(DEFINES), ["CI"]);
        assert!(settings.key().constants.contains("CI"));
    }
}
