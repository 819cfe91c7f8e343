//! Host error types
//!
//! Structural load errors, signature validation errors, registry conflicts
//! and cancellation all surface through [`HostError`]; the lifecycle manager
//! logs them and reports a boolean outcome to its callers.

use std::path::PathBuf;

/// Errors raised while loading a module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Failed to load library {path}: {reason}")]
    LibraryLoad { path: PathBuf, reason: String },

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("API version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Module returned a null descriptor: {0}")]
    NullDescriptor(PathBuf),

    #[error("No module registered for {0}")]
    NotRegistered(PathBuf),

    #[error("Module `{0}` has no entry type")]
    NoEntryType(String),

    #[error("Module `{module}` has multiple entry types: {types:?}")]
    MultipleEntryTypes { module: String, types: Vec<String> },

    #[error("Entry constructor of `{type_name}` panicked: {message}")]
    ConstructorPanicked { type_name: String, message: String },

    /// The backend keeps module files mapped and `path` is already in use
    #[error("Module {0} is already loaded; load a staged copy instead")]
    AlreadyMapped(PathBuf),

    #[error("Dependency {path} failed to load: {reason}")]
    Dependency { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while discovering capabilities.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ScanError {
    /// A tagged method does not have a shape its tag accepts.
    #[error("Invalid signature for `{object}::{method}` {signature}: {reason}")]
    Signature {
        object: String,
        method: String,
        signature: String,
        reason: String,
    },

    #[error("Registry rejected `{name}`: {reason}")]
    Registry { name: String, reason: String },

    #[error("Scan cancelled")]
    Cancelled,
}

/// Errors raised by the collaborator registries.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("{kind} `{name}` is already registered by plugin `{owner}`")]
    Duplicate {
        kind: &'static str,
        name: String,
        owner: String,
    },

    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Command `{0}` requires an active debuggee")]
    DebuggeeRequired(String),

    #[error("Expression `{name}` takes {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised by a dependency resolver.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DependencyError {
    #[error("Dependency `{0}` could not be resolved")]
    Unresolved(String),

    #[error("Dependency resolution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error taxonomy of the lifecycle manager.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HostError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already exists: {0}")]
    PluginAlreadyExists(String),

    #[error("Plugin `{0}` has no module path")]
    NoModulePath(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;
