//! Host configuration
//!
//! ```yaml
//! hotload:
//!   enable_hotloading: true
//!   cleanup_delay_ms: 2000
//!   staging_dir: ${XDG_CACHE_HOME}/hotload
//! watch:
//!   debounce_ms: 500
//!   extensions: [so, dylib, dll]
//! logging:
//!   level: debug
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use hotload_kernel::config::{self, ConfigResult};
use serde::{Deserialize, Serialize};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "HOTLOAD";

/// Complete host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub hotload: HotloadConfig,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Load from a file, with `HOTLOAD_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        config::load_with_env(path, ENV_PREFIX)
    }
}

/// Reload and retirement behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotloadConfig {
    /// Carry state into a new module version instead of restarting the plugin
    pub enable_hotloading: bool,
    /// Delay before superseded module files are deleted
    pub cleanup_delay_ms: u64,
    /// Delete superseded module and symbol files after a reload
    pub cleanup_superseded: bool,
    /// Quiescence polls before a retired module is released optimistically
    pub reclaim_passes: u32,
    /// Interval between quiescence polls
    pub reclaim_interval_ms: u64,
    /// Load modules whose API version differs from the host's
    pub allow_api_mismatch: bool,
    /// Directory that freshly built modules are copied into before loading
    pub staging_dir: Option<PathBuf>,
}

impl Default for HotloadConfig {
    fn default() -> Self {
        Self {
            enable_hotloading: true,
            cleanup_delay_ms: 2000,
            cleanup_superseded: true,
            reclaim_passes: 50,
            reclaim_interval_ms: 10,
            allow_api_mismatch: false,
            staging_dir: None,
        }
    }
}

impl HotloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable state transplant on reload
    pub fn with_hotloading(mut self, enabled: bool) -> Self {
        self.enable_hotloading = enabled;
        self
    }

    /// Set the delay before superseded files are deleted
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the quiescence wait applied when a module is retired
    pub fn with_reclaim(mut self, passes: u32, interval: Duration) -> Self {
        self.reclaim_passes = passes;
        self.reclaim_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the staging directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

/// Module directory watching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Minimum interval between two events for the same file
    pub debounce_ms: u64,
    /// File extensions treated as modules
    pub extensions: Vec<String>,
    /// Watch subdirectories
    pub recursive: bool,
    /// File name patterns to ignore (`*suffix`, `prefix*` or exact)
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            extensions: vec!["so".to_string(), "dylib".to_string(), "dll".to_string()],
            recursive: false,
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    /// Whether `path` looks like a module this host should react to
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
