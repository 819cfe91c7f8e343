//! `hotload run` command implementation

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hotload_host::watcher::plugin_name_for;
use hotload_host::{
    HostConfig, HostEvent, ModuleLoader, ModuleWatcher, PluginHost, PluginSpec, Registries,
    WatchEvent, WatchEventKind, cleanup,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn run(dir: &Path, config: HostConfig) -> anyhow::Result<()> {
    let loader = ModuleLoader::dynamic(config.hotload.clone());
    if let Some(staging_dir) = loader.staging_dir() {
        match cleanup::purge_stale(&staging_dir) {
            Ok(0) => {}
            Ok(removed) => {
                info!(removed, dir = %staging_dir.display(), "purged stale modules");
            }
            Err(e) => {
                warn!(
                    dir = %staging_dir.display(),
                    error = %e,
                    "failed to purge staging directory"
                );
            }
        }
    }

    let host = Arc::new(PluginHost::new(loader, Registries::default()));
    tokio::spawn(log_events(host.subscribe()));

    let mut watcher = ModuleWatcher::new(config.watch.clone());
    watcher
        .watch(dir)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    let mut changes = watcher
        .take_event_receiver()
        .context("watch receiver already taken")?;

    let cancel = CancellationToken::new();
    for path in watcher.scan_existing() {
        load_module(&host, &path, &cancel).await;
    }

    watcher.start()?;
    info!(
        dir = %dir.display(),
        plugins = host.plugins().len(),
        "watching for changes, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Some(change) => handle_change(&host, change, &cancel).await,
                None => break,
            },
        }
    }

    info!("shutting down");
    cancel.cancel();
    watcher.stop();
    host.shutdown_all(&CancellationToken::new()).await;
    Ok(())
}

async fn handle_change(host: &PluginHost, change: WatchEvent, cancel: &CancellationToken) {
    debug!(path = %change.path.display(), kind = ?change.kind, "module change");
    if let WatchEventKind::Renamed { from } = &change.kind {
        let current = change.plugin_name();
        let renamed = plugin_name_for(from).filter(|old| Some(old) != current.as_ref());
        if let Some(old) = renamed {
            host.unload(&old, cancel).await;
        }
    }

    if change.is_load() {
        load_module(host, &change.path, cancel).await;
    } else if let Some(name) = change.plugin_name() {
        host.unload(&name, cancel).await;
    }
}

/// Load or reload the plugin served by `path`
async fn load_module(host: &PluginHost, path: &Path, cancel: &CancellationToken) -> bool {
    let Some(name) = plugin_name_for(path) else {
        warn!(path = %path.display(), "cannot derive a plugin name");
        return false;
    };

    if !host.contains(&name) {
        if let Err(e) = host.add_plugin(PluginSpec::new(&name, path)) {
            warn!(plugin = %name, error = %e, "failed to add plugin");
            return false;
        }
    }

    if let Some(current) = host.current_module(&name) {
        if !ModuleLoader::has_changed(&current, path) {
            debug!(plugin = %name, "module unchanged, skipping reload");
            return true;
        }
    }

    host.reload(&name, path, cancel).await
}

async fn log_events(mut events: broadcast::Receiver<HostEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => info!(plugin = %event.plugin(), event = %line, "host event"),
                Err(e) => warn!(error = %e, "failed to encode host event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "host event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
