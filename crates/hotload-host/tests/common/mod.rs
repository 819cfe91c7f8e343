//! Common test utilities shared across `hotload-host` integration tests.
//!
//! Declared with `mod common;` inside each integration test file.

pub mod plugins;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hotload_host::kernel::ModuleDescriptor;
use hotload_host::loader::OpenedModule;
use hotload_host::{
    Commands, Expressions, HotloadConfig, LoadError, ModuleBackend, ModuleLoader, Menus,
    PluginHost, PluginSpec, Registries, StaticBackend,
};
use libloading::Library;
use parking_lot::RwLock;

/// Short quiescence and cleanup timings so tests don't sit in sleeps.
pub fn fast_config() -> HotloadConfig {
    HotloadConfig::default()
        .with_reclaim(5, Duration::from_millis(1))
        .with_cleanup_delay(Duration::from_millis(10))
}

/// A host over an in-process backend, with the concrete registries exposed.
pub struct Fixture {
    pub host: PluginHost,
    pub backend: Arc<StaticBackend>,
    pub commands: Arc<Commands>,
    pub expressions: Arc<Expressions>,
    pub menus: Arc<Menus>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: HotloadConfig) -> Self {
        let backend = Arc::new(StaticBackend::new());
        let commands = Arc::new(Commands::new());
        let expressions = Arc::new(Expressions::new());
        let menus = Arc::new(Menus::new());

        let registries = Registries::new(commands.clone(), expressions.clone(), menus.clone());
        let loader = ModuleLoader::new(backend.clone(), config);

        Self {
            host: PluginHost::new(loader, registries),
            backend,
            commands,
            expressions,
            menus,
        }
    }

    /// Serve `module` at `path` and track plugin `name` pointing at it
    pub fn add(&self, name: &str, path: &str, module: fn() -> ModuleDescriptor) {
        self.backend.register(path, module);
        self.host
            .add_plugin(PluginSpec::new(name, path))
            .expect("plugin added once");
    }

    /// Everything `plugin` has in the three registries
    pub fn registered(&self, plugin: &str) -> usize {
        self.commands.names_for(plugin).len()
            + self.expressions.names_for(plugin).len()
            + self.menus.paths_for(plugin).len()
    }
}

/// Serves in-process modules keyed by the text of the opened file, so a
/// staged copy resolves to the same module as the file it was copied from.
#[derive(Default)]
pub struct ContentBackend {
    modules: RwLock<HashMap<String, fn() -> ModuleDescriptor>>,
}

impl ContentBackend {
    pub fn register(&self, key: &str, module: fn() -> ModuleDescriptor) {
        self.modules.write().insert(key.to_string(), module);
    }

    /// Write a module file whose content selects the module registered as `key`
    pub fn write(dir: &Path, file: &str, key: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, key).expect("module file written");
        path
    }
}

impl ModuleBackend for ContentBackend {
    fn open(&self, path: &Path) -> Result<OpenedModule, LoadError> {
        let key = std::fs::read_to_string(path)?;
        let module = self
            .modules
            .read()
            .get(key.trim())
            .copied()
            .ok_or_else(|| LoadError::NotRegistered(path.to_path_buf()))?;
        Ok(OpenedModule {
            descriptor: module(),
            library: None,
        })
    }

    fn open_dependency(&self, _path: &Path) -> Result<Option<Library>, LoadError> {
        Ok(None)
    }
}

/// Files currently in `dir`, sorted
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
