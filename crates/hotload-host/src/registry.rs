//! Command, expression and menu registries
//!
//! Registrations are owned by the registries and tagged with the plugin that
//! made them. Each entry also holds the [`ModuleHandle`] of the module its
//! callback lives in, so that module stays mapped while the entry (or a
//! snapshot containing it) is alive.
//!
//! Tables are copy-on-write: lookups clone an `Arc` of the current list and
//! run callbacks without holding any lock, writers swap in a new list.

use std::fmt;
use std::sync::Arc;

use hotload_kernel::{MenuItem, MenuParent};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::RegistryError;
use crate::guard;
use crate::loader::ModuleHandle;

/// Normalised command callback: receives the command arguments and reports success.
pub type CommandHandler = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Menu callback: receives the triggered item.
pub type MenuAction = Arc<dyn Fn(&MenuItem) + Send + Sync>;

type WordFn0 = Arc<dyn Fn() -> usize + Send + Sync>;
type WordFn1 = Arc<dyn Fn(usize) -> usize + Send + Sync>;
type WordFn2 = Arc<dyn Fn(usize, usize) -> usize + Send + Sync>;
type WordFn3 = Arc<dyn Fn(usize, usize, usize) -> usize + Send + Sync>;

/// Expression function over machine words, by arity.
#[derive(Clone)]
pub enum ExpressionFn {
    Nullary(WordFn0),
    Unary(WordFn1),
    Binary(WordFn2),
    Ternary(WordFn3),
}

impl ExpressionFn {
    pub fn arity(&self) -> usize {
        match self {
            ExpressionFn::Nullary(_) => 0,
            ExpressionFn::Unary(_) => 1,
            ExpressionFn::Binary(_) => 2,
            ExpressionFn::Ternary(_) => 3,
        }
    }

    /// Call with `args`; `None` when the argument count does not match
    pub fn call(&self, args: &[usize]) -> Option<usize> {
        match (self, args) {
            (ExpressionFn::Nullary(f), []) => Some(f()),
            (ExpressionFn::Unary(f), [a]) => Some(f(*a)),
            (ExpressionFn::Binary(f), [a, b]) => Some(f(*a, *b)),
            (ExpressionFn::Ternary(f), [a, b, c]) => Some(f(*a, *b, *c)),
            _ => None,
        }
    }
}

impl fmt::Debug for ExpressionFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExpressionFn/{}", self.arity())
    }
}

/// Plugin and module a registration belongs to.
#[derive(Clone)]
pub struct Owner {
    pub plugin: String,
    pub module: ModuleHandle,
}

impl Owner {
    pub fn new(plugin: &str, module: ModuleHandle) -> Self {
        Self {
            plugin: plugin.to_string(),
            module,
        }
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("plugin", &self.plugin)
            .field("module", &self.module.id())
            .finish()
    }
}

/// A single registration.
pub struct Entry<T> {
    pub name: String,
    // Dropped before `owner`: the callback's code lives in the owner's module.
    pub value: T,
    pub owner: Owner,
}

type EntryList<T> = Arc<Vec<Arc<Entry<T>>>>;

struct EntryTable<T> {
    kind: &'static str,
    entries: RwLock<EntryList<T>>,
}

impl<T> EntryTable<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> EntryList<T> {
        self.entries.read().clone()
    }

    fn find(&self, name: &str) -> Option<Arc<Entry<T>>> {
        self.snapshot().iter().find(|e| e.name == name).cloned()
    }

    fn insert(&self, owner: &Owner, name: &str, value: T) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter().find(|e| e.name == name) {
            return Err(RegistryError::Duplicate {
                kind: self.kind,
                name: name.to_string(),
                owner: existing.owner.plugin.clone(),
            });
        }

        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(Arc::new(Entry {
            name: name.to_string(),
            owner: owner.clone(),
            value,
        }));
        *entries = Arc::new(next);

        debug!(kind = self.kind, name, plugin = %owner.plugin, "registered");
        Ok(())
    }

    fn remove_all_for(&self, plugin: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let next: Vec<_> = entries
            .iter()
            .filter(|e| e.owner.plugin != plugin)
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            *entries = Arc::new(next);
            debug!(kind = self.kind, plugin, removed, "removed registrations");
        }
        removed
    }

    fn names_for(&self, plugin: &str) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|e| e.owner.plugin == plugin)
            .map(|e| e.name.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Registry of debugger commands.
pub trait CommandRegistry: Send + Sync {
    fn register_command(
        &self,
        owner: &Owner,
        name: &str,
        debug_only: bool,
        handler: CommandHandler,
    ) -> Result<(), RegistryError>;

    /// Remove every command registered by `plugin`
    fn remove_all_for(&self, plugin: &str) -> usize;
}

/// Registry of expression functions.
pub trait ExpressionRegistry: Send + Sync {
    fn register_expression(
        &self,
        owner: &Owner,
        name: &str,
        function: ExpressionFn,
    ) -> Result<(), RegistryError>;

    /// Remove every expression registered by `plugin`
    fn remove_all_for(&self, plugin: &str) -> usize;
}

/// Registry of menu entries.
pub trait MenuRegistry: Send + Sync {
    /// Register `action` at the full menu path `path`
    fn register_menu(
        &self,
        owner: &Owner,
        path: &str,
        action: Option<MenuAction>,
    ) -> Result<(), RegistryError>;

    /// Add the plugin's root menu, `Main/{plugin}`
    fn add_plugin_menu(&self, owner: &Owner) -> Result<(), RegistryError> {
        self.register_menu(owner, &menu_path(MenuParent::Main, &owner.plugin, ""), None)
    }

    /// Remove every menu entry registered by `plugin`
    fn remove_all_for(&self, plugin: &str) -> usize;
}

/// Full path of a plugin menu entry: `{parent}/{plugin}/{path}`.
///
/// An empty `path` yields the plugin's root menu.
pub fn menu_path(parent: MenuParent, plugin: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{parent}/{plugin}")
    } else {
        format!("{parent}/{plugin}/{path}")
    }
}

/// A registered command.
#[derive(Clone)]
pub struct Command {
    pub debug_only: bool,
    pub handler: CommandHandler,
}

/// In-process command table.
pub struct Commands {
    table: EntryTable<Command>,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            table: EntryTable::new("command"),
        }
    }
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `name` with `args`.
    ///
    /// Debug-only commands fail with [`RegistryError::DebuggeeRequired`]
    /// unless a debuggee is active.
    pub fn execute(
        &self,
        name: &str,
        args: &[String],
        debuggee_active: bool,
    ) -> Result<bool, RegistryError> {
        let entry = self.table.find(name).ok_or_else(|| RegistryError::NotFound {
            kind: "command",
            name: name.to_string(),
        })?;

        if entry.value.debug_only && !debuggee_active {
            return Err(RegistryError::DebuggeeRequired(name.to_string()));
        }

        Ok(guard::guard_with_default(name, false, || {
            (entry.value.handler)(args)
        }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.find(name).is_some()
    }

    /// Plugin that registered `name`
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.table.find(name).map(|e| e.owner.plugin.clone())
    }

    pub fn names_for(&self, plugin: &str) -> Vec<String> {
        self.table.names_for(plugin)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandRegistry for Commands {
    fn register_command(
        &self,
        owner: &Owner,
        name: &str,
        debug_only: bool,
        handler: CommandHandler,
    ) -> Result<(), RegistryError> {
        self.table.insert(owner, name, Command {
            debug_only,
            handler,
        })
    }

    fn remove_all_for(&self, plugin: &str) -> usize {
        self.table.remove_all_for(plugin)
    }
}

/// In-process expression function table.
pub struct Expressions {
    table: EntryTable<ExpressionFn>,
}

impl Default for Expressions {
    fn default() -> Self {
        Self {
            table: EntryTable::new("expression"),
        }
    }
}

impl Expressions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `name` with `args`
    pub fn evaluate(&self, name: &str, args: &[usize]) -> Result<usize, RegistryError> {
        let entry = self.table.find(name).ok_or_else(|| RegistryError::NotFound {
            kind: "expression",
            name: name.to_string(),
        })?;

        let arity = entry.value.arity();
        if args.len() != arity {
            return Err(RegistryError::Arity {
                name: name.to_string(),
                expected: arity,
                actual: args.len(),
            });
        }

        Ok(guard::guard_with_default(name, 0, || {
            entry.value.call(args).unwrap_or(0)
        }))
    }

    /// Arity of `name`, if registered
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.table.find(name).map(|e| e.value.arity())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.find(name).is_some()
    }

    pub fn names_for(&self, plugin: &str) -> Vec<String> {
        self.table.names_for(plugin)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExpressionRegistry for Expressions {
    fn register_expression(
        &self,
        owner: &Owner,
        name: &str,
        function: ExpressionFn,
    ) -> Result<(), RegistryError> {
        self.table.insert(owner, name, function)
    }

    fn remove_all_for(&self, plugin: &str) -> usize {
        self.table.remove_all_for(plugin)
    }
}

/// In-process menu table, keyed by full path.
pub struct Menus {
    table: EntryTable<Option<MenuAction>>,
}

impl Default for Menus {
    fn default() -> Self {
        Self {
            table: EntryTable::new("menu"),
        }
    }
}

impl Menus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the action at `path`; returns `false` for entries without an action.
    pub fn trigger(&self, path: &str) -> Result<bool, RegistryError> {
        let entry = self.table.find(path).ok_or_else(|| RegistryError::NotFound {
            kind: "menu",
            name: path.to_string(),
        })?;

        let Some(action) = &entry.value else {
            return Ok(false);
        };
        let item = MenuItem {
            plugin: entry.owner.plugin.clone(),
            path: entry.name.clone(),
        };
        Ok(guard::guard_with_default(path, false, || {
            action(&item);
            true
        }))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.table.find(path).is_some()
    }

    pub fn paths_for(&self, plugin: &str) -> Vec<String> {
        self.table.names_for(plugin)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MenuRegistry for Menus {
    fn register_menu(
        &self,
        owner: &Owner,
        path: &str,
        action: Option<MenuAction>,
    ) -> Result<(), RegistryError> {
        self.table.insert(owner, path, action)
    }

    fn remove_all_for(&self, plugin: &str) -> usize {
        self.table.remove_all_for(plugin)
    }
}

/// The three registries a host registers capabilities into.
#[derive(Clone)]
pub struct Registries {
    pub commands: Arc<dyn CommandRegistry>,
    pub expressions: Arc<dyn ExpressionRegistry>,
    pub menus: Arc<dyn MenuRegistry>,
}

impl Registries {
    pub fn new(
        commands: Arc<dyn CommandRegistry>,
        expressions: Arc<dyn ExpressionRegistry>,
        menus: Arc<dyn MenuRegistry>,
    ) -> Self {
        Self {
            commands,
            expressions,
            menus,
        }
    }

    /// Remove everything `plugin` registered, in all three registries
    pub fn remove_all_for(&self, plugin: &str) -> usize {
        self.commands.remove_all_for(plugin)
            + self.expressions.remove_all_for(plugin)
            + self.menus.remove_all_for(plugin)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new(
            Arc::new(Commands::new()),
            Arc::new(Expressions::new()),
            Arc::new(Menus::new()),
        )
    }
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries").finish_non_exhaustive()
    }
}
