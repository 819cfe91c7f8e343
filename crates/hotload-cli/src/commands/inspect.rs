//! `hotload inspect` command implementation

use std::path::Path;

use anyhow::Context;
use hotload_host::{HostConfig, ModuleLoader};
use serde_json::json;

pub fn run(module: &Path, config: &HostConfig, as_json: bool) -> anyhow::Result<()> {
    // Loading does not stage, so the file is inspected in place
    let loader = ModuleLoader::dynamic(config.hotload.clone());

    let unit = loader
        .load(module, &[])
        .with_context(|| format!("failed to load {}", module.display()))?;
    let descriptor = unit.descriptor();
    let entry = unit.entry_type().ok().map(|t| t.name);

    if as_json {
        let types: Vec<_> = descriptor
            .types
            .iter()
            .map(|t| {
                let statics = t
                    .statics
                    .map(|s| (s.fields)().iter().map(|f| f.name).collect::<Vec<_>>());
                json!({
                    "name": t.name,
                    "entry": t.is_entry(),
                    "statics": statics,
                })
            })
            .collect();
        let out = json!({
            "module": descriptor.name,
            "version": descriptor.version,
            "path": module,
            "hash": unit.hash(),
            "entry": entry,
            "types": types,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} {}", descriptor.name, descriptor.version);
    println!("  path:  {}", module.display());
    if let Some(hash) = unit.hash() {
        println!("  hash:  {hash}");
    }
    match unit.entry_type() {
        Ok(t) => println!("  entry: {}", t.name),
        Err(e) => println!("  entry: (invalid: {e})"),
    }
    println!("  types:");
    for t in &descriptor.types {
        let mut line = format!("    {}", t.name);
        if t.is_entry() {
            line.push_str(" [entry]");
        }
        if let Some(statics) = t.statics {
            let fields: Vec<_> = (statics.fields)()
                .iter()
                .map(|f| format!("{}: {}", f.name, f.tag))
                .collect();
            line.push_str(&format!(" statics({})", fields.join(", ")));
        }
        println!("{line}");
    }
    Ok(())
}
