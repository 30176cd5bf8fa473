//! Fingerprint cache management.
//!
//! This module handles the fingerprint store under the build directory
//! (`build/.fwcache` by default).
//!
//! ## Commands
//!
//! - `fwb cache path` - Print cache directory location
//! - `fwb cache list` - List fingerprint records
//! - `fwb cache clean` - Drop every record
//! - `fwb cache prune` - Drop records of targets no longer in `fwbuild.toml`

use crate::config::BuildSettings;
use crate::deps::flatten;
use crate::fingerprint::DiskStore;
use crate::target::TargetId;
use crate::ui;
use anyhow::{Context, Result};
use colored::*;
use std::collections::HashSet;
use std::fs;

pub fn print_path(settings: &BuildSettings) -> Result<()> {
    println!("{}", settings.cache_dir.display());
    Ok(())
}

pub fn list(settings: &BuildSettings) -> Result<()> {
    let store = DiskStore::new(&settings.cache_dir);
    let entries = store.entries().context("Failed to read the fingerprint cache")?;

    if entries.is_empty() {
        println!("{} Cache is empty.", "ℹ".blue());
        return Ok(());
    }

    let mut table = ui::Table::new(&["Target", "Pre-gen", "Post-gen", "Deps", "Generated"]);
    for (path, record) in entries {
        match record {
            Ok(r) => table.add_row(vec![
                r.target.to_string(),
                short(&r.pre_gen),
                r.post_gen.as_deref().map(short).unwrap_or_else(|| "-".to_string()),
                flatten(&r.dependencies).len().to_string(),
                r.generated.len().to_string(),
            ]),
            Err(e) => table.add_row(vec![
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                "corrupt".red().to_string(),
                "-".to_string(),
                "-".to_string(),
                e.to_string(),
            ]),
        }
    }
    table.print();
    Ok(())
}

fn short(hash: &str) -> String {
    hash.chars().take(12).collect()
}

pub fn clean(settings: &BuildSettings) -> Result<()> {
    let cache_dir = &settings.cache_dir;
    if cache_dir.exists() {
        println!("{} Cleaning cache...", "🧹".yellow());
        fs::remove_dir_all(cache_dir)?;
        println!("{} Cache cleaned.", "✓".green());
    } else {
        println!("{} Cache already empty.", "✓".green());
    }
    Ok(())
}

/// Remove records that do not belong to any of `keep`. Unreadable records
/// are removed too; they would only ever produce misses.
pub fn prune_unused(settings: &BuildSettings, keep: &[TargetId]) -> Result<usize> {
    let store = DiskStore::new(&settings.cache_dir);
    let keep: HashSet<&TargetId> = keep.iter().collect();
    let mut removed_count = 0;

    for (path, record) in store.entries()? {
        let stale = match &record {
            Ok(r) => !keep.contains(&r.target),
            Err(_) => true,
        };
        if !stale {
            continue;
        }
        let name = match &record {
            Ok(r) => r.target.to_string(),
            Err(_) => path.display().to_string(),
        };
        println!("   {} Removing unused: {}", "🗑️".red(), name);
        if let Err(e) = fs::remove_file(&path) {
            println!("     Error removing {}: {}", name, e);
        } else {
            removed_count += 1;
        }
    }

    if removed_count == 0 {
        println!("{} All cached records are in use.", "✓".green());
    } else {
        println!("{} Removed {} unused records.", "✓".green(), removed_count);
    }

    Ok(removed_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FingerprintRecord, FingerprintStore, RECORD_VERSION};

    fn record(id: &TargetId) -> FingerprintRecord {
        FingerprintRecord {
            version: RECORD_VERSION,
            target: id.clone(),
            pre_gen: "0123456789abcdef".into(),
            post_gen: None,
            dependencies: vec![],
            generated: vec![],
        }
    }

    #[test]
    fn test_prune_keeps_listed_targets() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BuildSettings {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let store = DiskStore::new(&settings.cache_dir);
        let keep = TargetId::new("app", "m4");
        let gone = TargetId::new("old", "m4");
        store.save(&record(&keep)).unwrap();
        store.save(&record(&gone)).unwrap();
        fs::write(settings.cache_dir.join("junk.json"), "nope").unwrap();

        let removed = prune_unused(&settings, std::slice::from_ref(&keep)).unwrap();
        assert_eq!(removed, 2);
        assert!(store.load(&keep).unwrap().is_some());
        assert!(store.load(&gone).unwrap().is_none());
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
