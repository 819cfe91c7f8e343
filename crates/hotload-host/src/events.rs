//! Host events broadcast to subscribers

use std::path::PathBuf;

use serde::Serialize;

use crate::transplant::TransplantSummary;

/// Lifecycle notification emitted by [`PluginHost`](crate::PluginHost).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum HostEvent {
    /// A plugin started fresh
    Loaded {
        plugin: String,
        module: String,
        version: String,
    },
    /// A plugin moved to a new module with its state carried forward
    Reloaded {
        plugin: String,
        version: String,
        transplant: TransplantSummary,
    },
    /// A load or reload did not complete
    LoadFailed { plugin: String, error: String },
    /// A plugin was explicitly unloaded
    Unloaded { plugin: String },
    /// A superseded module file could not be deleted
    CleanupFailed {
        plugin: String,
        path: PathBuf,
        error: String,
    },
}

impl HostEvent {
    /// Plugin the event concerns
    pub fn plugin(&self) -> &str {
        match self {
            HostEvent::Loaded { plugin, .. }
            | HostEvent::Reloaded { plugin, .. }
            | HostEvent::LoadFailed { plugin, .. }
            | HostEvent::Unloaded { plugin }
            | HostEvent::CleanupFailed { plugin, .. } => plugin,
        }
    }
}
