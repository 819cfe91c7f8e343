//! Module file watcher
//!
//! Watches plugin directories and reports module files that appear, change or
//! disappear so the host can reload them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf },
}

/// A change to a module file.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub timestamp: Instant,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Instant::now(),
        }
    }

    /// Whether the event should trigger a (re)load of `path`
    pub fn is_load(&self) -> bool {
        !matches!(self.kind, WatchEventKind::Removed)
    }

    /// Plugin name derived from the module file name
    pub fn plugin_name(&self) -> Option<String> {
        plugin_name_for(&self.path)
    }
}

/// Plugin name for a module file: its stem without the platform `lib` prefix.
///
/// `libping.so`, `ping.dll` and `libping.dylib` all name `ping`.
pub fn plugin_name_for(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.strip_prefix("lib").filter(|s| !s.is_empty()).unwrap_or(stem);
    Some(name.to_string())
}

/// Coalesces bursts of events per path and releases each path once it has
/// been quiet for the debounce window.
///
/// Only paths with an unreleased event are kept.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (WatchEventKind, Instant)>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn record(&mut self, path: PathBuf, kind: WatchEventKind, now: Instant) {
        // a file that appeared and was then written to is still new
        let kind = match (self.pending.remove(&path), kind) {
            (Some((first @ WatchEventKind::Created, _)), WatchEventKind::Modified) => first,
            (Some((first @ WatchEventKind::Renamed { .. }, _)), WatchEventKind::Modified) => first,
            (_, kind) => kind,
        };
        self.pending.insert(path, (kind, now));
    }

    /// When the next pending path becomes due
    fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|(_, seen)| *seen + self.window).min()
    }

    /// Release every path that has been quiet for the window, oldest first
    fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, WatchEventKind)> {
        let window = self.window;
        let mut due: Vec<(PathBuf, WatchEventKind, Instant)> = Vec::new();
        self.pending.retain(|path, (kind, seen)| {
            if now.duration_since(*seen) >= window {
                due.push((path.clone(), kind.clone(), *seen));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(_, _, seen)| *seen);
        due.into_iter().map(|(path, kind, _)| (path, kind)).collect()
    }
}

/// Module file changes carried by a raw notify event.
fn classify(
    config: &WatchConfig,
    event: Event,
    rename_from: &mut Option<PathBuf>,
) -> Vec<(PathBuf, WatchEventKind)> {
    let mut changes = Vec::new();
    for path in event.paths {
        if !config.should_watch(&path) {
            continue;
        }
        let kind = match event.kind {
            EventKind::Create(CreateKind::File | CreateKind::Any) => WatchEventKind::Created,
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => WatchEventKind::Modified,
            EventKind::Remove(RemoveKind::File | RemoveKind::Any) => WatchEventKind::Removed,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                *rename_from = Some(path);
                continue;
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => match rename_from.take() {
                Some(from) => WatchEventKind::Renamed { from },
                None => WatchEventKind::Created,
            },
            _ => continue,
        };
        changes.push((path, kind));
    }
    changes
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Watches directories for module changes.
pub struct ModuleWatcher {
    config: WatchConfig,
    paths: Vec<PathBuf>,
    event_tx: mpsc::Sender<WatchEvent>,
    event_rx: Option<mpsc::Receiver<WatchEvent>>,
    watcher: Option<RecommendedWatcher>,
    shutdown: CancellationToken,
}

impl ModuleWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            config,
            paths: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
            watcher: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Take the event receiver. Only the first call returns it.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx.take()
    }

    fn mode(&self) -> RecursiveMode {
        if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }

    /// Add a directory to watch. Missing directories are skipped.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<(), notify::Error> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            warn!(path = %path.display(), "watch path does not exist");
            return Ok(());
        }
        if self.paths.contains(&path) {
            return Ok(());
        }

        let mode = self.mode();
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.watch(&path, mode)?;
        }
        info!(path = %path.display(), "watching for module changes");
        self.paths.push(path);
        Ok(())
    }

    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<(), notify::Error> {
        let path = path.as_ref();
        self.paths.retain(|p| p != path);
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.unwatch(path)?;
        }
        Ok(())
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Start delivering events to the receiver
    pub fn start(&mut self) -> Result<(), notify::Error> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
            Config::default().with_poll_interval(Duration::from_millis(100)),
        )?;

        let mode = self.mode();
        for path in &self.paths {
            watcher.watch(path, mode)?;
        }
        self.watcher = Some(watcher);

        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut debouncer = Debouncer::new(config.debounce());
            let mut rename_from: Option<PathBuf> = None;
            loop {
                let due = debouncer.next_due();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep_until_due(due) => {}
                    event = raw_rx.recv() => match event {
                        Some(event) => {
                            let now = Instant::now();
                            for (path, kind) in classify(&config, event, &mut rename_from) {
                                debouncer.record(path, kind, now);
                            }
                        }
                        None => break,
                    },
                }

                for (path, kind) in debouncer.take_due(Instant::now()) {
                    let event = WatchEvent::new(kind, path);
                    debug!(?event, "module change");
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!("module watcher stopped");
        });

        info!(paths = self.paths.len(), "module watcher started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.watcher = None;
    }

    /// Module files already present in the watched directories, sorted
    pub fn scan_existing(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = self
            .paths
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flat_map(|entries| entries.flatten())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.config.should_watch(path))
            .collect();
        found.sort();
        found
    }
}

impl Drop for ModuleWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
