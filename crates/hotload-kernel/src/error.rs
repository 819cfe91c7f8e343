//! Typed errors shared by the host and plugin modules.

use thiserror::Error;

use crate::value::TypeTag;

/// Errors raised while reading or writing a declared field.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FieldError {
    /// The object does not declare a field with this name.
    #[error("Unknown field: {0}")]
    Unknown(String),

    /// The value does not fit the field's declared type.
    #[error("Field `{field}` expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: TypeTag,
        actual: TypeTag,
    },

    /// The field is declared but cannot be written.
    #[error("Field `{0}` is read-only")]
    ReadOnly(String),
}

/// Errors raised by a bound method invoker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvokeError {
    #[error("Expected {expected} argument(s), got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("Argument {index} expects {expected}, got {actual}")]
    ArgumentType {
        index: usize,
        expected: TypeTag,
        actual: TypeTag,
    },

    /// The method ran and reported a failure.
    #[error("Invocation failed: {0}")]
    Failed(String),
}

/// Errors reported by plugin lifecycle hooks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    #[error("Plugin startup failed: {0}")]
    StartupFailed(String),

    #[error("Plugin shutdown failed: {0}")]
    ShutdownFailed(String),

    /// A hotload participant could not rebuild its non-transplantable state.
    #[error("Hotload notification failed: {0}")]
    HotloadFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Result type for plugin hooks.
pub type PluginResult<T> = Result<T, PluginError>;
