//! Deferred removal of superseded module files
//!
//! A retired module may still be mapped for a moment after a reload, so its
//! files are deleted from a detached task after a delay. Failures are only
//! logged; leftovers in the staging directory are purged on the next start.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::HostEvent;

/// Delete `path`, treating an already missing file as success.
fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Delete every file in `files`, returning the ones that could not be removed.
pub fn remove_files(files: &[PathBuf]) -> Vec<(PathBuf, io::Error)> {
    let mut failed = Vec::new();
    for path in files {
        match remove_path(path) {
            Ok(()) => debug!(path = %path.display(), "removed superseded file"),
            Err(e) => failed.push((path.clone(), e)),
        }
    }
    failed
}

/// Spawn a detached task that deletes `files` after `delay`.
///
/// The returned handle may be dropped; the task keeps running.
pub fn schedule_removal(
    plugin: &str,
    files: Vec<PathBuf>,
    delay: Duration,
    events: broadcast::Sender<HostEvent>,
) -> JoinHandle<()> {
    let plugin = plugin.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        for (path, error) in remove_files(&files) {
            warn!(
                plugin = %plugin,
                path = %path.display(),
                error = %error,
                "failed to delete superseded module file"
            );
            let _ = events.send(HostEvent::CleanupFailed {
                plugin: plugin.clone(),
                path,
                error: error.to_string(),
            });
        }
    })
}

/// Remove every entry of `staging_dir` left behind by a previous process.
///
/// Returns the number of entries removed. A missing directory is not an error.
pub fn purge_stale(staging_dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        match remove_path(&path) {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to purge stale module file");
            }
        }
    }

    if removed > 0 {
        info!(dir = %staging_dir.display(), removed, "purged stale staged modules");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("old.so");
        let symbols = dir.path().join("old.so.dSYM");
        std::fs::write(&module, b"old").unwrap();
        std::fs::create_dir(&symbols).unwrap();
        std::fs::write(symbols.join("info"), b"x").unwrap();

        let files = vec![module.clone(), symbols.clone(), dir.path().join("gone.pdb")];
        assert!(remove_files(&files).is_empty());
        assert!(!module.exists());
        assert!(!symbols.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_removal_waits_for_delay() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("old.so");
        std::fs::write(&module, b"old").unwrap();

        let (tx, _rx) = broadcast::channel(8);
        let handle = schedule_removal("ping", vec![module.clone()], Duration::from_secs(2), tx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(module.exists());

        handle.await.unwrap();
        assert!(!module.exists());
    }

    #[test]
    fn test_purge_stale() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        assert_eq!(purge_stale(&staging).unwrap(), 0);

        std::fs::create_dir(&staging).unwrap();
        std::fs::write(staging.join("a-1.so"), b"a").unwrap();
        std::fs::write(staging.join("a-1.pdb"), b"a").unwrap();

        assert_eq!(purge_stale(&staging).unwrap(), 2);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }
}
