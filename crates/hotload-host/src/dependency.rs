//! Dependency resolution
//!
//! Plugins may depend on libraries that must be loaded before their module.
//! Fetching and building those packages is someone else's job; the host only
//! asks a [`DependencyResolver`] for the library paths to load.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DependencyError;
use crate::lifecycle::PluginSpec;

/// Resolves the libraries a plugin's module needs at load time.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Library paths to load before `plugin`'s module, in load order
    async fn resolve(
        &self,
        plugin: &PluginSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DependencyError>;
}

/// Resolver for plugins without dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

#[async_trait]
impl DependencyResolver for NoDependencies {
    async fn resolve(
        &self,
        _plugin: &PluginSpec,
        _cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DependencyError> {
        Ok(Vec::new())
    }
}

/// Fixed dependency lists keyed by plugin name.
#[derive(Debug, Default, Clone)]
pub struct StaticDependencies {
    dependencies: HashMap<String, Vec<PathBuf>>,
    required: Vec<String>,
}

impl StaticDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the libraries `plugin` depends on
    pub fn with(mut self, plugin: &str, libraries: Vec<PathBuf>) -> Self {
        self.dependencies.insert(plugin.to_string(), libraries);
        self
    }

    /// Fail resolution for plugins that have no declared list
    pub fn require(mut self, plugin: &str) -> Self {
        self.required.push(plugin.to_string());
        self
    }
}

#[async_trait]
impl DependencyResolver for StaticDependencies {
    async fn resolve(
        &self,
        plugin: &PluginSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DependencyError> {
        if cancel.is_cancelled() {
            return Err(DependencyError::Cancelled);
        }
        match self.dependencies.get(&plugin.name) {
            Some(libraries) => Ok(libraries.clone()),
            None if self.required.contains(&plugin.name) => {
                Err(DependencyError::Unresolved(plugin.name.clone()))
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_dependencies() {
        let resolver = StaticDependencies::new()
            .with("ping", vec![PathBuf::from("libzydis.so")])
            .require("dump");
        let cancel = CancellationToken::new();

        let ping = PluginSpec::new("ping", "ping.so");
        assert_eq!(
            resolver.resolve(&ping, &cancel).await.unwrap(),
            vec![PathBuf::from("libzydis.so")]
        );

        let other = PluginSpec::new("other", "other.so");
        assert!(resolver.resolve(&other, &cancel).await.unwrap().is_empty());

        let dump = PluginSpec::new("dump", "dump.so");
        assert!(matches!(
            resolver.resolve(&dump, &cancel).await,
            Err(DependencyError::Unresolved(_))
        ));

        cancel.cancel();
        assert!(matches!(
            resolver.resolve(&ping, &cancel).await,
            Err(DependencyError::Cancelled)
        ));
    }
}
