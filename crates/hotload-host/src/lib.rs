//! 热加载宿主
//!
//! Loads plugin modules, swaps them at runtime and keeps plugin state alive
//! across versions:
//! - Module loading and retirement
//! - Capability discovery into command, expression and menu registries
//! - State transplant between old and new module versions
//! - Plugin lifecycle, file watching and deferred cleanup

pub mod cleanup;
pub mod config;
pub mod dependency;
pub mod error;
pub mod events;
pub mod guard;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod scanner;
pub mod transplant;
pub mod watcher;

pub use config::{HostConfig, HotloadConfig, LoggingConfig, WatchConfig};
pub use dependency::{DependencyResolver, NoDependencies, StaticDependencies};
pub use error::{
    DependencyError, HostError, HostResult, LoadError, RegistryError, ScanError,
};
pub use events::HostEvent;
pub use lifecycle::{PluginHost, PluginInfo, PluginSpec, PluginState};
pub use loader::{
    DynamicBackend, ModuleBackend, ModuleHandle, ModuleLoader, ModuleUnit, StaticBackend,
};
pub use registry::{
    CommandHandler, CommandRegistry, Commands, ExpressionFn, ExpressionRegistry, Expressions,
    MenuAction, MenuRegistry, Menus, Owner, Registries,
};
pub use scanner::{CapabilityScanner, ScanReport};
pub use transplant::{
    Skip, SkipReason, TransplantContext, TransplantReport, TransplantSummary, transplant,
};
pub use watcher::{ModuleWatcher, WatchEvent, WatchEventKind};

pub use hotload_kernel as kernel;
