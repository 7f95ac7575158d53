//! Closed property and command tables.
//!
//! Each object context (solution body, template/module body, settings
//! object) has its own table. A property or command that is not registered
//! for the context it appears in is an error: the language has no implicit
//! properties.
//!
//! Every property definition carries its value kind, which decides both the
//! read step (parsed [`Value`] → native [`PropertyValue`]) and the merge
//! rule applied for `set` / `add`.

use std::sync::LazyLock;

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use crate::ast::{Action, Value};
use crate::error::{CompileError, Result};
use crate::matcher::Pattern;
use crate::settings::{Item, PropertyBag, PropertyValue};

/// Registered property names.
pub mod names {
    // ── Solution ──
    pub const INCLUDE_PROJECTS: &str = "include projects";
    pub const OUTPUT_PATH: &str = "output path";

    // ── Template / module ──
    pub const PROJECTS: &str = "projects";

    // ── Project settings ──
    pub const TARGET_FRAMEWORK: &str = "target framework";
    pub const PROJECT_GUID: &str = "project guid";
    pub const OUTPUT_TYPE: &str = "output type";
    pub const ROOT_NAMESPACE: &str = "root namespace";
    pub const ASSEMBLY_NAME: &str = "assembly name";
    pub const SOURCE_PATH: &str = "source path";
    pub const INCLUDE_FILES: &str = "include files";
    pub const EXCLUDE_FILES: &str = "exclude files";
    pub const LIB_REFS: &str = "lib refs";
    pub const PROJECT_REFS: &str = "project refs";
    pub const DEFINES: &str = "defines";
    pub const CUSTOM_XML: &str = "custom xml";
    pub const PROPERTIES: &str = "properties";
}

use names::*;

// ═══════════════════════════════════════════════════════════════════════════════
//  Definitions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Solution,
    Template,
    ProjectSettings,
}

/// Shape of a property value and its merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Single value; only `set` is allowed.
    Scalar,
    /// Ordered set; `set` replaces, `add` unions.
    Set,
    /// Ordered `key -> item` map; `set` replaces, `add` inserts or overwrites.
    Dictionary,
}

/// What a single item of a property must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Text,
    Pattern,
    Xml,
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyDefinition {
    pub name: &'static str,
    pub kind: ValueKind,
    pub item: ItemKind,
    default: Option<&'static str>,
}

impl PropertyDefinition {
    const fn new(name: &'static str, kind: ValueKind, item: ItemKind) -> Self {
        Self { name, kind, item, default: None }
    }

    const fn with_default(mut self, text: &'static str) -> Self {
        self.default = Some(text);
        self
    }

    /// A fresh default value. Never shared between bags.
    pub fn default_value(&self) -> PropertyValue {
        match self.kind {
            ValueKind::Scalar => PropertyValue::Scalar(self.default.map(|t| Item::Text(t.to_string()))),
            ValueKind::Set => PropertyValue::Set(IndexSet::new()),
            ValueKind::Dictionary => PropertyValue::Dictionary(IndexMap::new()),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> CompileError {
        CompileError::InvalidValue { property: self.name.to_string(), message: message.into() }
    }

    fn read_item(&self, value: &Value) -> Result<Item> {
        match (self.item, value) {
            (ItemKind::Text, Value::Literal(text)) => Ok(Item::Text(text.clone())),
            (ItemKind::Xml, Value::Xml(text)) => Ok(Item::Xml(text.clone())),
            (ItemKind::Pattern, value) => Pattern::from_value(value)
                .map(Item::Pattern)
                .ok_or_else(|| self.invalid(format!("expected a pattern, found {value}"))),
            (ItemKind::Text, other) => Err(self.invalid(format!("expected text, found {other}"))),
            (ItemKind::Xml, other) => Err(self.invalid(format!("expected an xml block, found {other}"))),
        }
    }

    fn read_items(&self, value: &Value, into: &mut IndexSet<Item>) -> Result<()> {
        match value {
            Value::None => Ok(()),
            Value::Array(values) => values.iter().try_for_each(|v| self.read_items(v, into)),
            single => {
                into.insert(self.read_item(single)?);
                Ok(())
            }
        }
    }

    fn read_entry(&self, value: &Value, into: &mut IndexMap<String, Item>) -> Result<()> {
        match value {
            Value::Pair(key, item) => {
                into.insert(key.clone(), self.read_item(item)?);
                Ok(())
            }
            other => Err(CompileError::MalformedDeclaration {
                property: self.name.to_string(),
                found: other.to_string(),
            }),
        }
    }

    /// Convert a parsed value into this property's native representation.
    ///
    /// `none` reads as an empty value: no item for a scalar, an empty
    /// collection otherwise.
    pub fn read(&self, value: &Value) -> Result<PropertyValue> {
        match self.kind {
            ValueKind::Scalar => match value {
                Value::None => Ok(PropertyValue::Scalar(None)),
                Value::Array(_) => Err(self.invalid("expected a single value, found an array")),
                single => Ok(PropertyValue::Scalar(Some(self.read_item(single)?))),
            },
            ValueKind::Set => {
                let mut items = IndexSet::new();
                self.read_items(value, &mut items)?;
                Ok(PropertyValue::Set(items))
            }
            ValueKind::Dictionary => {
                let mut entries = IndexMap::new();
                match value {
                    Value::None => {}
                    Value::Array(values) => {
                        for value in values {
                            self.read_entry(value, &mut entries)?;
                        }
                    }
                    single => self.read_entry(single, &mut entries)?,
                }
                Ok(PropertyValue::Dictionary(entries))
            }
        }
    }

    /// Merge `incoming` into `current` according to `action`.
    pub fn merge(&self, current: &mut PropertyValue, action: Action, incoming: PropertyValue) -> Result<()> {
        match (action, current, incoming) {
            (Action::Set, current, incoming) => {
                *current = incoming;
                Ok(())
            }
            (Action::Add, PropertyValue::Scalar(_), _) => Err(CompileError::InvalidAction(self.name.to_string())),
            (Action::Add, PropertyValue::Set(items), PropertyValue::Set(more)) => {
                items.extend(more);
                Ok(())
            }
            (Action::Add, PropertyValue::Dictionary(entries), PropertyValue::Dictionary(more)) => {
                entries.extend(more);
                Ok(())
            }
            (Action::Add, _, _) => Err(self.invalid("value does not match the property kind")),
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Result of a command: keep walking the object, or stop here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

pub type CommandAction = fn(&mut PropertyBag, Option<&str>) -> Result<Flow>;

#[derive(Clone, Copy)]
pub struct CommandDefinition {
    pub name: &'static str,
    pub action: CommandAction,
}

impl std::fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDefinition").field("name", &self.name).finish()
    }
}

fn exclude(bag: &mut PropertyBag, _: Option<&str>) -> Result<Flow> {
    bag.exclude();
    Ok(Flow::Terminate)
}

fn skip(_: &mut PropertyBag, _: Option<&str>) -> Result<Flow> {
    Ok(Flow::Terminate)
}

fn warn_command(_: &mut PropertyBag, message: Option<&str>) -> Result<Flow> {
    warn!("{}", message.unwrap_or("warning"));
    Ok(Flow::Continue)
}

fn error_command(_: &mut PropertyBag, message: Option<&str>) -> Result<Flow> {
    Err(CompileError::User(message.unwrap_or("error").to_string()))
}

const EXCLUDE: CommandDefinition = CommandDefinition { name: "exclude", action: exclude };
const SKIP: CommandDefinition = CommandDefinition { name: "skip", action: skip };
const WARN: CommandDefinition = CommandDefinition { name: "warn", action: warn_command };
const ERROR: CommandDefinition = CommandDefinition { name: "error", action: error_command };

// ═══════════════════════════════════════════════════════════════════════════════
//  Registries
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct Registry {
    context: Context,
    properties: IndexMap<&'static str, PropertyDefinition>,
    commands: IndexMap<&'static str, CommandDefinition>,
}

static SOLUTION: LazyLock<Registry> = LazyLock::new(|| {
    use ItemKind as I;
    use ValueKind as V;
    Registry::new(
        Context::Solution,
        [
            PropertyDefinition::new(INCLUDE_PROJECTS, V::Set, I::Pattern),
            PropertyDefinition::new(OUTPUT_PATH, V::Scalar, I::Text).with_default("."),
        ],
        [WARN, ERROR],
    )
});

static TEMPLATE: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new(
        Context::Template,
        [PropertyDefinition::new(PROJECTS, ValueKind::Dictionary, ItemKind::Text)],
        [EXCLUDE, SKIP, WARN, ERROR],
    )
});

static PROJECT_SETTINGS: LazyLock<Registry> = LazyLock::new(|| {
    use ItemKind as I;
    use ValueKind as V;
    Registry::new(
        Context::ProjectSettings,
        [
            PropertyDefinition::new(TARGET_FRAMEWORK, V::Scalar, I::Text),
            PropertyDefinition::new(PROJECT_GUID, V::Scalar, I::Text),
            PropertyDefinition::new(OUTPUT_TYPE, V::Scalar, I::Text).with_default("Library"),
            PropertyDefinition::new(ROOT_NAMESPACE, V::Scalar, I::Text),
            PropertyDefinition::new(ASSEMBLY_NAME, V::Scalar, I::Text),
            PropertyDefinition::new(SOURCE_PATH, V::Scalar, I::Text).with_default("$(MODULE_NAME)"),
            PropertyDefinition::new(INCLUDE_FILES, V::Set, I::Pattern),
            PropertyDefinition::new(EXCLUDE_FILES, V::Set, I::Pattern),
            PropertyDefinition::new(LIB_REFS, V::Set, I::Text),
            PropertyDefinition::new(PROJECT_REFS, V::Set, I::Text),
            PropertyDefinition::new(DEFINES, V::Set, I::Text),
            PropertyDefinition::new(CUSTOM_XML, V::Set, I::Xml),
            PropertyDefinition::new(PROPERTIES, V::Dictionary, I::Text),
        ],
        [EXCLUDE, SKIP, WARN, ERROR],
    )
});

impl Registry {
    fn new(
        context: Context,
        properties: impl IntoIterator<Item = PropertyDefinition>,
        commands: impl IntoIterator<Item = CommandDefinition>,
    ) -> Self {
        Self {
            context,
            properties: properties.into_iter().map(|p| (p.name, p)).collect(),
            commands: commands.into_iter().map(|c| (c.name, c)).collect(),
        }
    }

    pub fn for_context(context: Context) -> &'static Registry {
        match context {
            Context::Solution => &SOLUTION,
            Context::Template => &TEMPLATE,
            Context::ProjectSettings => &PROJECT_SETTINGS,
        }
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn property(&self, name: &str) -> Result<&PropertyDefinition> {
        self.properties
            .get(name)
            .ok_or_else(|| CompileError::UnrecognizedProperty(name.to_string()))
    }

    pub fn command(&self, name: &str) -> Result<&CommandDefinition> {
        self.commands
            .get(name)
            .ok_or_else(|| CompileError::UnrecognizedCommand(name.to_string()))
    }

    /// Definitions in registration order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.properties.values()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
