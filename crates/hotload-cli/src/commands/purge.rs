//! `hotload purge` command implementation

use std::path::Path;

use anyhow::Context;
use hotload_host::cleanup;

pub fn run(dir: &Path) -> anyhow::Result<()> {
    let removed = cleanup::purge_stale(dir)
        .with_context(|| format!("failed to purge {}", dir.display()))?;
    println!("Removed {removed} stale module file(s) from {}", dir.display());
    Ok(())
}
