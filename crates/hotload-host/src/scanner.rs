//! Capability scanner
//!
//! Walks a plugin's live object graph and registers every tagged method as a
//! command, expression or menu entry. Only objects whose type is defined by
//! the plugin's module are visited; everything else (host objects, objects
//! from other modules) is opaque to the walk.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use hotload_kernel::{
    MenuItem, MenuParent, MethodDecl, ObjectRef, Signature, Tag, TypeTag, Value, object_id,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RegistryError, ScanError};
use crate::loader::ModuleHandle;
use crate::registry::{CommandHandler, ExpressionFn, MenuAction, Owner, Registries, menu_path};

/// Registrations made by one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Objects inspected
    pub visited: usize,
    pub commands: Vec<String>,
    pub expressions: Vec<String>,
    /// Full menu paths, including the plugin root menu
    pub menus: Vec<String>,
    /// Registrations refused by a registry, with the reason
    pub conflicts: Vec<(String, String)>,
}

impl ScanReport {
    /// Total number of registrations made
    pub fn registered(&self) -> usize {
        self.commands.len() + self.expressions.len() + self.menus.len()
    }
}

/// A validated registration, ready to hand to a registry.
enum Capability {
    Command {
        name: String,
        debug_only: bool,
        handler: CommandHandler,
    },
    Expression {
        name: String,
        function: ExpressionFn,
    },
    Menu {
        path: String,
        action: MenuAction,
    },
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Command { name, .. } => write!(f, "Command({name})"),
            Capability::Expression { name, function } => {
                write!(f, "Expression({name}/{})", function.arity())
            }
            Capability::Menu { path, .. } => write!(f, "Menu({path})"),
        }
    }
}

/// Discovers and registers the capabilities of a live object graph.
#[derive(Debug, Clone)]
pub struct CapabilityScanner {
    registries: Registries,
}

impl CapabilityScanner {
    pub fn new(registries: Registries) -> Self {
        Self { registries }
    }

    /// Walk the graph below `root` and register its capabilities under `plugin`.
    ///
    /// Every tag of a method is validated before any of them is registered.
    /// A signature error aborts the scan; registrations already made are left
    /// for the caller to remove.
    pub fn scan(
        &self,
        plugin: &str,
        module: &ModuleHandle,
        root: &ObjectRef,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        let owner = Owner::new(plugin, module.clone());
        let mut report = ScanReport::default();
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];

        while let Some(node) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if !visited.insert(object_id(&node)) {
                continue;
            }
            let type_name = node.type_name();
            if !module.declares(type_name) {
                debug!(plugin, type_name, "skipping foreign object");
                continue;
            }
            report.visited += 1;

            for method in node.clone().methods() {
                if method.tags.is_empty() {
                    continue;
                }
                let capabilities = method
                    .tags
                    .iter()
                    .map(|tag| Self::bind(plugin, type_name, &method, tag))
                    .collect::<Result<Vec<_>, _>>()?;

                for capability in capabilities {
                    self.register(&owner, capability, &mut report)?;
                }
            }

            let children: Vec<ObjectRef> = node
                .children()
                .iter()
                .filter_map(|child| child.walkable().cloned())
                .collect();
            stack.extend(children.into_iter().rev());
        }

        match self.registries.menus.add_plugin_menu(&owner) {
            Ok(()) => report.menus.push(menu_path(MenuParent::Main, plugin, "")),
            Err(e) => Self::conflict(plugin, e, &mut report)?,
        }

        debug!(
            plugin,
            visited = report.visited,
            commands = report.commands.len(),
            expressions = report.expressions.len(),
            menus = report.menus.len(),
            "scan complete"
        );
        Ok(report)
    }

    fn register(
        &self,
        owner: &Owner,
        capability: Capability,
        report: &mut ScanReport,
    ) -> Result<(), ScanError> {
        let plugin = owner.plugin.as_str();
        match capability {
            Capability::Command {
                name,
                debug_only,
                handler,
            } => match self
                .registries
                .commands
                .register_command(owner, &name, debug_only, handler)
            {
                Ok(()) => report.commands.push(name),
                Err(e) => Self::conflict(plugin, e, report)?,
            },
            Capability::Expression { name, function } => match self
                .registries
                .expressions
                .register_expression(owner, &name, function)
            {
                Ok(()) => report.expressions.push(name),
                Err(e) => Self::conflict(plugin, e, report)?,
            },
            Capability::Menu { path, action } => match self
                .registries
                .menus
                .register_menu(owner, &path, Some(action))
            {
                Ok(()) => report.menus.push(path),
                Err(e) => Self::conflict(plugin, e, report)?,
            },
        }
        Ok(())
    }

    /// Name conflicts are recorded and skipped; anything else fails the scan.
    fn conflict(
        plugin: &str,
        error: RegistryError,
        report: &mut ScanReport,
    ) -> Result<(), ScanError> {
        match error {
            RegistryError::Duplicate { ref name, .. } => {
                warn!(plugin, error = %error, "registration skipped");
                report.conflicts.push((name.clone(), error.to_string()));
                Ok(())
            }
            other => Err(ScanError::Registry {
                name: plugin.to_string(),
                reason: other.to_string(),
            }),
        }
    }

    fn invalid(type_name: &str, method: &MethodDecl, reason: &str) -> ScanError {
        ScanError::Signature {
            object: type_name.to_string(),
            method: method.name.to_string(),
            signature: method.signature.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Validate `method` against `tag` and normalise it into a registrable callback.
    fn bind(
        plugin: &str,
        type_name: &str,
        method: &MethodDecl,
        tag: &Tag,
    ) -> Result<Capability, ScanError> {
        match tag {
            Tag::Command { name, debug_only } => Ok(Capability::Command {
                name: name.clone(),
                debug_only: *debug_only,
                handler: Self::command_handler(type_name, method)?,
            }),
            Tag::Expression { name } => Ok(Capability::Expression {
                name: name.clone(),
                function: Self::expression_fn(type_name, method)?,
            }),
            Tag::Menu { path, parent } => Ok(Capability::Menu {
                path: menu_path(*parent, plugin, path),
                action: Self::menu_action(type_name, method)?,
            }),
            _ => Err(Self::invalid(type_name, method, "unsupported capability tag")),
        }
    }

    /// Commands take no arguments or a string list, and return nothing or a bool.
    fn command_handler(type_name: &str, method: &MethodDecl) -> Result<CommandHandler, ScanError> {
        let Signature { params, ret } = &method.signature;
        let takes_args = match params.as_slice() {
            [] => false,
            [TypeTag::StrList] => true,
            _ => {
                return Err(Self::invalid(
                    type_name,
                    method,
                    "command parameters must be () or (string[])",
                ));
            }
        };
        let returns_bool = match ret {
            TypeTag::Unit => false,
            TypeTag::Bool => true,
            _ => {
                return Err(Self::invalid(
                    type_name,
                    method,
                    "command must return () or bool",
                ));
            }
        };

        let invoke = method.invoke.clone();
        let name = method.name;
        Ok(Arc::new(move |args: &[String]| {
            let input = if takes_args {
                vec![Value::StrList(args.to_vec())]
            } else {
                Vec::new()
            };
            match invoke(&input) {
                Ok(Value::Bool(ok)) if returns_bool => ok,
                Ok(_) => !returns_bool,
                Err(e) => {
                    warn!(method = name, error = %e, "command failed");
                    false
                }
            }
        }))
    }

    /// Expressions take up to three machine words and return one.
    fn expression_fn(type_name: &str, method: &MethodDecl) -> Result<ExpressionFn, ScanError> {
        let Signature { params, ret } = &method.signature;
        if *ret != TypeTag::Word {
            return Err(Self::invalid(
                type_name,
                method,
                "expression functions must return usize",
            ));
        }
        if params.iter().any(|p| *p != TypeTag::Word) {
            return Err(Self::invalid(
                type_name,
                method,
                "expression function arguments must be usize",
            ));
        }

        let invoke = method.invoke.clone();
        let name = method.name;
        let call = move |args: &[usize]| -> usize {
            let input: Vec<Value> = args.iter().copied().map(Value::Word).collect();
            match invoke(&input) {
                Ok(Value::Word(v)) => v,
                Ok(other) => {
                    warn!(
                        method = name,
                        returned = %other.tag(),
                        "expression returned a non-word value"
                    );
                    0
                }
                Err(e) => {
                    warn!(method = name, error = %e, "expression failed");
                    0
                }
            }
        };

        let function = match params.len() {
            0 => ExpressionFn::Nullary(Arc::new(move || call(&[]))),
            1 => ExpressionFn::Unary(Arc::new(move |a| call(&[a]))),
            2 => ExpressionFn::Binary(Arc::new(move |a, b| call(&[a, b]))),
            3 => ExpressionFn::Ternary(Arc::new(move |a, b, c| call(&[a, b, c]))),
            _ => {
                return Err(Self::invalid(
                    type_name,
                    method,
                    "expression functions take at most 3 arguments",
                ));
            }
        };
        Ok(function)
    }

    /// Menu actions take the triggered menu item and return nothing.
    fn menu_action(type_name: &str, method: &MethodDecl) -> Result<MenuAction, ScanError> {
        let Signature { params, ret } = &method.signature;
        if !matches!(params.as_slice(), [TypeTag::MenuItem]) || *ret != TypeTag::Unit {
            return Err(Self::invalid(
                type_name,
                method,
                "menu actions must be (menu-item) -> ()",
            ));
        }

        let invoke = method.invoke.clone();
        let name = method.name;
        Ok(Arc::new(move |item: &MenuItem| {
            if let Err(e) = invoke(&[Value::MenuItem(item.clone())]) {
                warn!(method = name, error = %e, "menu action failed");
            }
        }))
    }
}
