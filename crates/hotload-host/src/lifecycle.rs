//! Plugin lifecycle manager
//!
//! Owns one record per plugin and drives every load, reload and unload:
//!
//! 1. drop the plugin's registrations (and shut it down unless hot-reloading)
//! 2. resolve dependencies and load the new module
//! 3. construct the module's entry type
//! 4. transplant state from the previous instance, or start the new one fresh
//! 5. publish the new instance and module
//! 6. retire the previous module and schedule its files for deletion
//! 7. scan the new object graph and register its capabilities
//!
//! A failure at any step tears the plugin down to `Unloaded`; nothing is
//! rolled back. Operations report a boolean and log the error.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hotload_kernel::{ObjectRef, StateBag};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup;
use crate::config::HotloadConfig;
use crate::dependency::{DependencyResolver, NoDependencies};
use crate::error::{HostError, HostResult};
use crate::events::HostEvent;
use crate::guard;
use crate::loader::{ModuleHandle, ModuleLoader};
use crate::registry::Registries;
use crate::scanner::{CapabilityScanner, ScanReport};
use crate::transplant::{TransplantContext, TransplantReport, transplant};

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Reloading,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Reloading => "reloading",
        };
        f.write_str(s)
    }
}

/// What the host knows about a plugin before loading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    /// Source tree the module is built from
    pub source_path: Option<PathBuf>,
    /// Compiled module to load
    pub module_path: Option<PathBuf>,
}

impl PluginSpec {
    pub fn new(name: &str, module_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            source_path: None,
            module_path: Some(module_path.into()),
        }
    }

    /// A plugin whose module has not been built yet
    pub fn unbuilt(name: &str, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            source_path: Some(source_path.into()),
            module_path: None,
        }
    }

    pub fn with_source(mut self, source_path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(source_path.into());
        self
    }
}

/// The live root object of a plugin and the module it was built from.
pub struct LiveInstance {
    // Dropped before `module`.
    pub object: ObjectRef,
    pub module: ModuleHandle,
}

impl fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveInstance")
            .field("type", &self.object.type_name())
            .field("module", &self.module.id())
            .finish()
    }
}

/// Everything the host tracks for one plugin.
#[derive(Debug)]
pub struct PluginRecord {
    name: String,
    source_path: Option<PathBuf>,
    module_path: Option<PathBuf>,
    instance: Option<LiveInstance>,
    instance_type: Option<String>,
    requires_rebuild: bool,
    dependencies: Vec<PathBuf>,
    state: PluginState,
    reload_count: u32,
    loaded_at: Option<DateTime<Utc>>,
    last_reload: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl PluginRecord {
    fn new(spec: PluginSpec) -> Self {
        Self {
            name: spec.name,
            source_path: spec.source_path,
            module_path: spec.module_path,
            instance: None,
            instance_type: None,
            requires_rebuild: false,
            dependencies: Vec::new(),
            state: PluginState::Unloaded,
            reload_count: 0,
            loaded_at: None,
            last_reload: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn instance(&self) -> Option<&ObjectRef> {
        self.instance.as_ref().map(|i| &i.object)
    }

    pub fn module(&self) -> Option<&ModuleHandle> {
        self.instance.as_ref().map(|i| &i.module)
    }

    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: self.name.clone(),
            source_path: self.source_path.clone(),
            module_path: self.module_path.clone(),
        }
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            state: self.state,
            source_path: self.source_path.clone(),
            module_path: self.module_path.clone(),
            module_version: self.module().map(|m| m.version().to_string()),
            instance_type: self.instance_type.clone(),
            requires_rebuild: self.requires_rebuild,
            dependencies: self.dependencies.clone(),
            reload_count: self.reload_count,
            loaded_at: self.loaded_at,
            last_reload: self.last_reload,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a plugin record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub state: PluginState,
    pub source_path: Option<PathBuf>,
    pub module_path: Option<PathBuf>,
    pub module_version: Option<String>,
    pub instance_type: Option<String>,
    pub requires_rebuild: bool,
    pub dependencies: Vec<PathBuf>,
    pub reload_count: u32,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_reload: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

enum Outcome {
    Started(ScanReport),
    Reloaded(TransplantReport, ScanReport),
}

/// What a reload has taken over so far, released again if it fails.
#[derive(Default)]
struct Attempt {
    previous: Option<LiveInstance>,
    staged: Option<PathBuf>,
}

/// Hosts hot-swappable plugins.
pub struct PluginHost {
    loader: ModuleLoader,
    registries: Registries,
    scanner: CapabilityScanner,
    resolver: Arc<dyn DependencyResolver>,
    plugins: RwLock<HashMap<String, Arc<Mutex<PluginRecord>>>>,
    event_tx: broadcast::Sender<HostEvent>,
}

impl PluginHost {
    pub fn new(loader: ModuleLoader, registries: Registries) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            loader,
            scanner: CapabilityScanner::new(registries.clone()),
            registries,
            resolver: Arc::new(NoDependencies),
            plugins: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Use `resolver` to find plugin dependencies
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn config(&self) -> &HotloadConfig {
        self.loader.config()
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Subscribe to host events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.event_tx.send(event);
    }

    fn record(&self, name: &str) -> HostResult<Arc<Mutex<PluginRecord>>> {
        self.plugins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))
    }

    /// Start tracking a plugin. Nothing is loaded yet.
    pub fn add_plugin(&self, spec: PluginSpec) -> HostResult<()> {
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&spec.name) {
            return Err(HostError::PluginAlreadyExists(spec.name));
        }
        debug!(plugin = %spec.name, "plugin added");
        plugins.insert(spec.name.clone(), Arc::new(Mutex::new(PluginRecord::new(spec))));
        Ok(())
    }

    /// Names of all tracked plugins, sorted
    pub fn plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<PluginState> {
        let record = self.record(name).ok()?;
        let record = record.lock().await;
        Some(record.state)
    }

    pub async fn info(&self, name: &str) -> Option<PluginInfo> {
        let record = self.record(name).ok()?;
        let record = record.lock().await;
        Some(record.info())
    }

    /// Module currently serving `name`
    pub fn current_module(&self, name: &str) -> Option<ModuleHandle> {
        self.loader.current(name)
    }

    /// Flag that the plugin's sources changed and its module must be rebuilt
    pub async fn mark_requires_rebuild(&self, name: &str) -> bool {
        let Ok(record) = self.record(name) else {
            return false;
        };
        record.lock().await.requires_rebuild = true;
        true
    }

    pub async fn requires_rebuild(&self, name: &str) -> Option<bool> {
        let record = self.record(name).ok()?;
        let record = record.lock().await;
        Some(record.requires_rebuild)
    }

    /// Field values of the plugin's live root object
    pub async fn snapshot(&self, name: &str) -> Option<StateBag> {
        let record = self.record(name).ok()?;
        let record = record.lock().await;
        let object = record.instance()?;
        guard::catch(|| StateBag::capture(object.as_ref())).ok()
    }

    /// Load the plugin from its configured module path
    pub async fn load(&self, name: &str, cancel: &CancellationToken) -> bool {
        let module_path = match self.record(name) {
            Ok(record) => record.lock().await.module_path.clone(),
            Err(e) => {
                error!(plugin = name, error = %e, "load failed");
                return false;
            }
        };
        let Some(module_path) = module_path else {
            let e = HostError::NoModulePath(name.to_string());
            error!(plugin = name, error = %e, "load failed");
            return false;
        };
        self.reload(name, &module_path, cancel).await
    }

    /// Load `module_path` as the plugin's new module.
    ///
    /// When hotloading is enabled and the plugin is live, its state is carried
    /// into the new instance. Otherwise the old instance is shut down and the
    /// new one started fresh.
    pub async fn reload(&self, name: &str, module_path: &Path, cancel: &CancellationToken) -> bool {
        let record = match self.record(name) {
            Ok(record) => record,
            Err(e) => {
                error!(plugin = name, error = %e, "reload failed");
                return false;
            }
        };
        let mut record = record.lock().await;
        let started = Instant::now();
        let mut attempt = Attempt::default();

        match self
            .reload_locked(&mut record, module_path, cancel, &mut attempt)
            .await
        {
            Ok(outcome) => {
                let now = Utc::now();
                let module = record.module().cloned();
                let version = module.as_ref().map(|m| m.version().to_string()).unwrap_or_default();
                record.state = PluginState::Loaded;
                record.module_path = Some(module_path.to_path_buf());
                record.requires_rebuild = false;
                record.last_error = None;
                record.last_reload = Some(now);

                match outcome {
                    Outcome::Started(scan) => {
                        record.loaded_at = Some(now);
                        info!(
                            plugin = name,
                            version = %version,
                            registered = scan.registered(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "plugin loaded"
                        );
                        self.emit(HostEvent::Loaded {
                            plugin: name.to_string(),
                            module: module.map(|m| m.name().to_string()).unwrap_or_default(),
                            version,
                        });
                    }
                    Outcome::Reloaded(report, scan) => {
                        record.reload_count += 1;
                        info!(
                            plugin = name,
                            version = %version,
                            fields = report.fields_copied,
                            statics = report.statics_copied,
                            skipped = report.skipped.len(),
                            registered = scan.registered(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "plugin hot-reloaded"
                        );
                        self.emit(HostEvent::Reloaded {
                            plugin: name.to_string(),
                            version,
                            transplant: report.summary(),
                        });
                    }
                }
                true
            }
            Err(e) => {
                error!(plugin = name, path = %module_path.display(), error = %e, "reload failed");
                self.tear_down(&mut record, attempt).await;
                record.last_error = Some(e.to_string());
                self.emit(HostEvent::LoadFailed {
                    plugin: name.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    fn check(cancel: &CancellationToken) -> HostResult<()> {
        if cancel.is_cancelled() {
            Err(HostError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn reload_locked(
        &self,
        record: &mut PluginRecord,
        module_path: &Path,
        cancel: &CancellationToken,
        attempt: &mut Attempt,
    ) -> HostResult<Outcome> {
        let name = record.name.clone();
        let previous = &mut attempt.previous;
        let hot = self.config().enable_hotloading && record.instance.is_some();

        self.registries.remove_all_for(&name);
        *previous = record.instance.take();
        if let Some(prev) = previous.as_ref().filter(|_| !hot) {
            Self::shutdown_instance(&name, &prev.object);
        }
        record.state = if previous.is_some() {
            PluginState::Reloading
        } else {
            PluginState::Loading
        };
        Self::check(cancel)?;

        let mut spec = record.spec();
        spec.module_path = Some(module_path.to_path_buf());
        let dependencies = self.resolver.resolve(&spec, cancel).await?;
        Self::check(cancel)?;

        let staged = self.loader.stage(module_path)?;
        if self.loader.is_staged(&staged) {
            attempt.staged = Some(staged.clone());
        }
        let module = self.loader.load(&staged, &dependencies)?;
        record.dependencies = dependencies;
        Self::check(cancel)?;

        let old_module = previous.as_ref().filter(|_| hot).map(|p| p.module.clone());
        let (instance, report) = {
            let mut ctx = TransplantContext::new(old_module, module.clone());
            let instance = ctx.create()?;
            let report = match previous.as_ref().filter(|_| hot) {
                Some(prev) => Some(transplant(&mut ctx, &prev.object, &instance)),
                None => {
                    Self::start_instance(&name, &instance);
                    None
                }
            };
            (instance, report)
        };

        record.instance_type = Some(instance.type_name().to_string());
        record.instance = Some(LiveInstance {
            object: instance.clone(),
            module: module.clone(),
        });
        drop(self.loader.publish(&name, module.clone()));

        if let Some(prev) = previous.take() {
            self.retire(&name, prev, &module).await;
        }
        Self::check(cancel)?;

        let scan = self.scanner.scan(&name, &module, &instance, cancel)?;
        Ok(match report {
            Some(report) => Outcome::Reloaded(report, scan),
            None => Outcome::Started(scan),
        })
    }

    fn start_instance(name: &str, instance: &ObjectRef) {
        let Some(entry) = instance.as_entry() else {
            return;
        };
        if let Err(e) = guard::guard_hook("startup", || entry.startup()) {
            warn!(plugin = name, error = %e, "plugin startup failed");
        }
    }

    fn shutdown_instance(name: &str, instance: &ObjectRef) {
        let Some(entry) = instance.as_entry() else {
            return;
        };
        if let Err(e) = guard::guard_hook("shutdown", || entry.shutdown()) {
            warn!(plugin = name, error = %e, "plugin shutdown failed");
        }
    }

    /// Release a superseded module and schedule its files for deletion.
    async fn retire(&self, name: &str, previous: LiveInstance, replacement: &ModuleHandle) {
        let LiveInstance { object, module } = previous;
        drop(object);

        let files = module.files();
        let superseded = module.path() != replacement.path();
        debug!(plugin = name, module = %module.id(), "retiring module");
        self.loader.unload(module).await;

        if superseded && self.config().cleanup_superseded {
            self.remove_later(name, files);
        }
    }

    /// Delete module files once the cleanup delay has passed
    fn remove_later(&self, name: &str, files: Vec<PathBuf>) {
        let delay = self.config().cleanup_delay();
        cleanup::schedule_removal(name, files, delay, self.event_tx.clone());
    }

    /// Release whatever a failed reload left behind.
    ///
    /// Staged copies of both the new and the previous module are scheduled
    /// for deletion; the plugin's own module path is left untouched.
    async fn tear_down(&self, record: &mut PluginRecord, attempt: Attempt) {
        let name = record.name.clone();
        self.registries.remove_all_for(&name);
        drop(self.loader.take_current(&name));

        let mut leftovers: Vec<PathBuf> = attempt
            .staged
            .iter()
            .flat_map(|staged| {
                std::iter::once(staged.clone()).chain(ModuleLoader::find_symbols(staged))
            })
            .collect();

        for live in [record.instance.take(), attempt.previous].into_iter().flatten() {
            let LiveInstance { object, module } = live;
            drop(object);
            if self.loader.is_staged(module.path()) {
                leftovers.extend(module.files());
            }
            self.loader.unload(module).await;
        }

        leftovers.sort();
        leftovers.dedup();
        if !leftovers.is_empty() {
            self.remove_later(&name, leftovers);
        }

        record.instance_type = None;
        record.state = PluginState::Unloaded;
    }

    /// Shut the plugin down and release its module.
    ///
    /// A plugin that was never loaded is left as is and reported as unloaded.
    pub async fn unload(&self, name: &str, cancel: &CancellationToken) -> bool {
        let record = match self.record(name) {
            Ok(record) => record,
            Err(e) => {
                warn!(plugin = name, error = %e, "unload failed");
                return false;
            }
        };

        let mut record = record.lock().await;
        if record.instance.is_some() && cancel.is_cancelled() {
            warn!(plugin = name, "unload cancelled");
            return false;
        }
        record.requires_rebuild = false;
        let Some(live) = record.instance.take() else {
            record.state = PluginState::Unloaded;
            debug!(plugin = name, "plugin not loaded, nothing to unload");
            return true;
        };

        // shutdown may still reach the plugin's own registrations
        Self::shutdown_instance(name, &live.object);
        self.registries.remove_all_for(name);
        drop(self.loader.take_current(name));

        let LiveInstance { object, module } = live;
        drop(object);
        let staged = self.loader.is_staged(module.path()).then(|| module.files());
        self.loader.unload(module).await;
        if let Some(files) = staged {
            self.remove_later(name, files);
        }

        record.instance_type = None;
        record.state = PluginState::Unloaded;
        info!(plugin = name, "plugin unloaded");
        self.emit(HostEvent::Unloaded {
            plugin: name.to_string(),
        });
        true
    }

    /// Unload the plugin and stop tracking it
    pub async fn remove_plugin(&self, name: &str, cancel: &CancellationToken) -> bool {
        if !self.unload(name, cancel).await {
            return false;
        }
        self.plugins.write().remove(name);
        debug!(plugin = name, "plugin removed");
        true
    }

    /// Unload every plugin, returning how many were unloaded cleanly
    pub async fn shutdown_all(&self, cancel: &CancellationToken) -> usize {
        let mut unloaded = 0;
        for name in self.plugins() {
            if self.unload(&name, cancel).await {
                unloaded += 1;
            }
        }
        info!(unloaded, "all plugins shut down");
        unloaded
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("loader", &self.loader)
            .field("plugins", &self.plugins())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticBackend;

    fn host() -> PluginHost {
        let loader = ModuleLoader::new(Arc::new(StaticBackend::new()), HotloadConfig::default());
        PluginHost::new(loader, Registries::default())
    }

    #[test]
    fn test_plugin_state_display() {
        assert_eq!(PluginState::Reloading.to_string(), "reloading");
        assert_eq!(
            serde_json::to_value(PluginState::Loaded).unwrap(),
            serde_json::json!("loaded")
        );
    }

    #[test]
    fn test_add_plugin_rejects_duplicates() {
        let host = host();
        host.add_plugin(PluginSpec::new("b", "b.so")).unwrap();
        host.add_plugin(PluginSpec::unbuilt("a", "src/a")).unwrap();

        assert!(matches!(
            host.add_plugin(PluginSpec::new("a", "a.so")),
            Err(HostError::PluginAlreadyExists(_))
        ));
        assert_eq!(host.plugins(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_load_without_module_path_fails() {
        let host = host();
        host.add_plugin(PluginSpec::unbuilt("a", "src/a")).unwrap();

        assert!(!host.load("a", &CancellationToken::new()).await);
        assert!(!host.load("missing", &CancellationToken::new()).await);
        assert_eq!(host.state("a").await, Some(PluginState::Unloaded));
    }

    #[tokio::test]
    async fn test_requires_rebuild_flag() {
        let host = host();
        host.add_plugin(PluginSpec::new("a", "a.so")).unwrap();

        assert!(host.mark_requires_rebuild("a").await);
        assert_eq!(host.requires_rebuild("a").await, Some(true));

        assert!(host.unload("a", &CancellationToken::new()).await);
        assert_eq!(host.requires_rebuild("a").await, Some(false));
        assert!(!host.mark_requires_rebuild("missing").await);
    }
}
