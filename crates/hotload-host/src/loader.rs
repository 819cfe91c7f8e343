//! Module loader
//!
//! Loads compiled plugin modules, tracks the current module of every plugin
//! and retires superseded ones. A module stays mapped for as long as any
//! [`ModuleHandle`] to it is alive: the plugin record, registry entries and
//! in-flight callbacks all hold one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hotload_kernel::module::{API_VERSION_SYMBOL, MODULE_SYMBOL};
use hotload_kernel::{API_VERSION, ModuleDescriptor, TypeDescriptor};
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HotloadConfig;
use crate::error::LoadError;

/// Shared reference to a loaded module.
pub type ModuleHandle = Arc<ModuleUnit>;

/// Builds the descriptor of a module linked into the host.
pub type ModuleFactory = Arc<dyn Fn() -> ModuleDescriptor + Send + Sync>;

/// Debug-symbol artifacts produced next to a module, in lookup order.
const SYMBOL_SUFFIXES: &[&str] = &["pdb", "dSYM", "dwp"];

/// Staging directory used when none is configured and the backend maps files.
pub fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("hotload-staging")
}

/// A loaded module and everything it keeps alive.
pub struct ModuleUnit {
    id: Uuid,
    path: PathBuf,
    symbols_path: Option<PathBuf>,
    hash: Option<String>,
    loaded_at: DateTime<Utc>,
    // Field order is drop order: the descriptor borrows the library image,
    // and the library may link against its dependencies.
    descriptor: ModuleDescriptor,
    library: Option<Library>,
    dependencies: Vec<Library>,
}

impl ModuleUnit {
    /// A unit backed by no library at all.
    pub fn in_memory(descriptor: ModuleDescriptor) -> ModuleHandle {
        Arc::new(Self {
            id: Uuid::now_v7(),
            path: PathBuf::from(format!("<memory>/{}", descriptor.name)),
            symbols_path: None,
            hash: None,
            loaded_at: Utc::now(),
            descriptor,
            library: None,
            dependencies: Vec::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The module file that was loaded
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Debug-symbol artifact found next to the module, if any
    pub fn symbols_path(&self) -> Option<&Path> {
        self.symbols_path.as_deref()
    }

    /// SHA-256 of the module file when it was loaded
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    /// Whether objects of `type_name` are defined by this module
    pub fn declares(&self, type_name: &str) -> bool {
        self.descriptor.declares(type_name)
    }

    /// The module's single entry type
    pub fn entry_type(&self) -> Result<&TypeDescriptor, LoadError> {
        let mut entries = self.descriptor.entry_types();
        match (entries.next(), entries.next()) {
            (Some(entry), None) => Ok(entry),
            (None, _) => Err(LoadError::NoEntryType(self.descriptor.name.clone())),
            (Some(_), Some(_)) => Err(LoadError::MultipleEntryTypes {
                module: self.descriptor.name.clone(),
                types: self
                    .descriptor
                    .entry_types()
                    .map(|t| t.name.to_string())
                    .collect(),
            }),
        }
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Files that belong to this unit on disk
    pub fn files(&self) -> Vec<PathBuf> {
        std::iter::once(self.path.clone())
            .chain(self.symbols_path.clone())
            .collect()
    }
}

impl fmt::Debug for ModuleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleUnit")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("path", &self.path)
            .field("dynamic", &self.library.is_some())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

impl Drop for ModuleUnit {
    fn drop(&mut self) {
        debug!(module = %self.descriptor.name, path = %self.path.display(), "releasing module");
    }
}

/// A module opened by a backend.
pub struct OpenedModule {
    pub descriptor: ModuleDescriptor,
    pub library: Option<Library>,
}

/// Source of module code.
pub trait ModuleBackend: Send + Sync {
    /// Open the module at `path` and read its descriptor
    fn open(&self, path: &Path) -> Result<OpenedModule, LoadError>;

    /// Open a dependency that must stay loaded while the module is
    fn open_dependency(&self, path: &Path) -> Result<Option<Library>, LoadError>;

    /// Whether an opened module keeps its file mapped.
    ///
    /// The platform loader hands back the already mapped image when the same
    /// path is opened twice, so such modules are always loaded from a
    /// uniquely named staged copy.
    fn maps_files(&self) -> bool {
        false
    }
}

/// Loads modules from shared libraries.
#[derive(Debug, Default)]
pub struct DynamicBackend {
    allow_api_mismatch: bool,
}

impl DynamicBackend {
    pub fn new(allow_api_mismatch: bool) -> Self {
        Self { allow_api_mismatch }
    }

    fn open_library(path: &Path) -> Result<Library, LoadError> {
        // SAFETY: loading a library runs its initialisers; modules are trusted
        // code produced for this host.
        unsafe { Library::new(path) }.map_err(|e| LoadError::LibraryLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl ModuleBackend for DynamicBackend {
    fn open(&self, path: &Path) -> Result<OpenedModule, LoadError> {
        let library = Self::open_library(path)?;

        let api_version = unsafe {
            let version_fn: Result<Symbol<unsafe extern "C" fn() -> u32>, _> =
                library.get(API_VERSION_SYMBOL);
            match version_fn {
                Ok(func) => func(),
                Err(_) => API_VERSION,
            }
        };

        if api_version != API_VERSION {
            if !self.allow_api_mismatch {
                return Err(LoadError::VersionMismatch {
                    expected: API_VERSION,
                    actual: api_version,
                });
            }
            warn!(
                path = %path.display(),
                expected = API_VERSION,
                actual = api_version,
                "loading module with mismatched API version"
            );
        }

        let descriptor = unsafe {
            let module_fn: Symbol<unsafe extern "C" fn() -> *mut ModuleDescriptor> = library
                .get(MODULE_SYMBOL)
                .map_err(|e| LoadError::SymbolNotFound(format!("_hotload_module: {e}")))?;

            let raw = module_fn();
            if raw.is_null() {
                return Err(LoadError::NullDescriptor(path.to_path_buf()));
            }
            *Box::from_raw(raw)
        };

        Ok(OpenedModule {
            descriptor,
            library: Some(library),
        })
    }

    fn open_dependency(&self, path: &Path) -> Result<Option<Library>, LoadError> {
        Self::open_library(path)
            .map(Some)
            .map_err(|e| LoadError::Dependency {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn maps_files(&self) -> bool {
        true
    }
}

/// Serves modules linked into the host process, keyed by path.
///
/// Registering a new factory under an existing path stands in for a rebuilt
/// module: the next load of that path yields the new descriptor.
#[derive(Default)]
pub struct StaticBackend {
    modules: RwLock<HashMap<PathBuf, ModuleFactory>>,
    dependencies: RwLock<HashSet<PathBuf>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the module served for `path`
    pub fn register<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> ModuleDescriptor + Send + Sync + 'static,
    {
        self.modules.write().insert(path.into(), Arc::new(factory));
    }

    /// Forget the module served for `path`
    pub fn remove(&self, path: &Path) -> bool {
        self.modules.write().remove(path).is_some()
    }

    /// Declare a dependency path as available
    pub fn register_dependency(&self, path: impl Into<PathBuf>) {
        self.dependencies.write().insert(path.into());
    }
}

impl ModuleBackend for StaticBackend {
    fn open(&self, path: &Path) -> Result<OpenedModule, LoadError> {
        let factory = self
            .modules
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotRegistered(path.to_path_buf()))?;

        Ok(OpenedModule {
            descriptor: factory(),
            library: None,
        })
    }

    fn open_dependency(&self, path: &Path) -> Result<Option<Library>, LoadError> {
        if self.dependencies.read().contains(path) {
            Ok(None)
        } else {
            Err(LoadError::Dependency {
                path: path.to_path_buf(),
                reason: "not available".to_string(),
            })
        }
    }
}

/// Loads, tracks and retires plugin modules.
pub struct ModuleLoader {
    backend: Arc<dyn ModuleBackend>,
    config: HotloadConfig,
    current: RwLock<HashMap<String, ModuleHandle>>,
}

impl ModuleLoader {
    pub fn new(backend: Arc<dyn ModuleBackend>, config: HotloadConfig) -> Self {
        Self {
            backend,
            config,
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Loader backed by shared libraries on disk
    pub fn dynamic(config: HotloadConfig) -> Self {
        let backend = Arc::new(DynamicBackend::new(config.allow_api_mismatch));
        Self::new(backend, config)
    }

    pub fn config(&self) -> &HotloadConfig {
        &self.config
    }

    fn calculate_hash(path: &Path) -> Option<String> {
        let contents = std::fs::read(path).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Some(format!("{:x}", hasher.finalize()))
    }

    /// First debug-symbol artifact that exists next to `path`
    pub fn find_symbols(path: &Path) -> Option<PathBuf> {
        SYMBOL_SUFFIXES.iter().find_map(|suffix| {
            let replaced = path.with_extension(suffix);
            let mut appended = path.as_os_str().to_owned();
            appended.push(".");
            appended.push(suffix);
            [replaced, PathBuf::from(appended)]
                .into_iter()
                .find(|candidate| candidate.exists())
        })
    }

    /// Load `path` after loading each of `dependencies`.
    pub fn load(&self, path: &Path, dependencies: &[PathBuf]) -> Result<ModuleHandle, LoadError> {
        info!(path = %path.display(), dependencies = dependencies.len(), "loading module");

        let mut libraries = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            debug!(dependency = %dependency.display(), "loading dependency");
            if let Some(library) = self.backend.open_dependency(dependency)? {
                libraries.push(library);
            }
        }

        if self.backend.maps_files() && self.is_current_path(path) {
            return Err(LoadError::AlreadyMapped(path.to_path_buf()));
        }

        let opened = self.backend.open(path)?;

        let unit = Arc::new(ModuleUnit {
            id: Uuid::now_v7(),
            path: path.to_path_buf(),
            symbols_path: Self::find_symbols(path),
            hash: Self::calculate_hash(path),
            loaded_at: Utc::now(),
            descriptor: opened.descriptor,
            library: opened.library,
            dependencies: libraries,
        });

        info!(
            module = %unit.name(),
            version = %unit.version(),
            types = unit.descriptor.types.len(),
            "loaded module"
        );
        Ok(unit)
    }

    fn is_current_path(&self, path: &Path) -> bool {
        self.current.read().values().any(|unit| unit.path() == path)
    }

    /// Current module of `plugin`
    pub fn current(&self, plugin: &str) -> Option<ModuleHandle> {
        self.current.read().get(plugin).cloned()
    }

    /// Make `unit` the current module of `plugin`, returning the previous one
    pub fn publish(&self, plugin: &str, unit: ModuleHandle) -> Option<ModuleHandle> {
        self.current.write().insert(plugin.to_string(), unit)
    }

    /// Stop tracking the current module of `plugin`
    pub fn take_current(&self, plugin: &str) -> Option<ModuleHandle> {
        self.current.write().remove(plugin)
    }

    /// Whether `path` differs from what `unit` was loaded from
    pub fn has_changed(unit: &ModuleUnit, path: &Path) -> bool {
        match (unit.hash(), Self::calculate_hash(path)) {
            (Some(old), Some(new)) => old != new,
            _ => true,
        }
    }

    /// Release `unit` and wait for its remaining references to drain.
    ///
    /// Returns `true` when the unit was fully released within the configured
    /// number of passes. Otherwise the caller proceeds anyway and the module
    /// is unmapped whenever its last reference drops.
    pub async fn unload(&self, unit: ModuleHandle) -> bool {
        let name = unit.name().to_string();
        let weak = Arc::downgrade(&unit);
        drop(unit);

        for _ in 0..self.config.reclaim_passes {
            if weak.strong_count() == 0 {
                debug!(module = %name, "module released");
                return true;
            }
            tokio::time::sleep(self.config.reclaim_interval()).await;
        }

        let remaining = weak.strong_count();
        if remaining == 0 {
            return true;
        }
        warn!(
            module = %name,
            remaining,
            passes = self.config.reclaim_passes,
            "module still referenced after quiescence wait, continuing"
        );
        false
    }

    /// Directory staged copies are written to.
    ///
    /// The configured directory wins. Backends that map module files fall
    /// back to [`default_staging_dir`]; other backends load in place.
    pub fn staging_dir(&self) -> Option<PathBuf> {
        self.config
            .staging_dir
            .clone()
            .or_else(|| self.backend.maps_files().then(default_staging_dir))
    }

    /// Whether `path` is a copy made by [`stage`](Self::stage)
    pub fn is_staged(&self, path: &Path) -> bool {
        self.staging_dir().is_some_and(|dir| path.starts_with(dir))
    }

    /// Copy a module (and its debug symbols) into the staging directory.
    ///
    /// Without a staging directory the path is returned unchanged.
    pub fn stage(&self, path: &Path) -> Result<PathBuf, LoadError> {
        let Some(staging_dir) = self.staging_dir() else {
            return Ok(path.to_path_buf());
        };
        std::fs::create_dir_all(&staging_dir)?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        let unique = format!("{stem}-{}", Uuid::now_v7().simple());

        let mut staged = staging_dir.join(&unique);
        if let Some(ext) = path.extension() {
            staged.set_extension(ext);
        }
        std::fs::copy(path, &staged)?;

        if let Some(symbols) = Self::find_symbols(path) {
            if symbols.is_file() {
                let mut staged_symbols = staging_dir.join(&unique);
                if let Some(ext) = symbols.extension() {
                    staged_symbols.set_extension(ext);
                }
                if let Err(e) = std::fs::copy(&symbols, &staged_symbols) {
                    warn!(path = %symbols.display(), error = %e, "failed to stage debug symbols");
                }
            }
        }

        debug!(from = %path.display(), to = %staged.display(), "staged module");
        Ok(staged)
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("config", &self.config)
            .field("current", &self.current.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
