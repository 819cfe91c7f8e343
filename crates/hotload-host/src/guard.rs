//! Panic guards around plugin code.
//!
//! Lifecycle hooks, hotload notifications and registered callbacks all run
//! code from a loaded module. A panic there must never unwind into the host's
//! reload sequence, so every such call goes through one of these helpers.

use std::panic::{AssertUnwindSafe, catch_unwind};

use hotload_kernel::{PluginError, PluginResult};
use tracing::error;

/// Extract a human-readable message from a panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// Run `f`, converting a panic into `Err(message)`.
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// Run a plugin hook, turning a panic into [`PluginError::Other`].
pub fn guard_hook(op: &'static str, f: impl FnOnce() -> PluginResult<()>) -> PluginResult<()> {
    match catch(f) {
        Ok(result) => result,
        Err(msg) => {
            error!(op, panic = %msg, "panic in plugin hook");
            Err(PluginError::Other(format!("panic in `{op}`: {msg}")))
        }
    }
}

/// Run a callback that has a safe default, returning `default` on panic.
pub fn guard_with_default<T>(op: &str, default: T, f: impl FnOnce() -> T) -> T {
    match catch(f) {
        Ok(value) => value,
        Err(msg) => {
            error!(op, panic = %msg, "panic in plugin callback");
            default
        }
    }
}
