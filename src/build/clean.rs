//! Build artifact cleanup.
//!
//! This module provides the `fwb clean` command for removing build outputs.
//!
//! ## Options
//!
//! - `fwb clean` - Remove the output directory, fingerprint cache included
//! - `fwb clean --cache` - Only drop fingerprint records, forcing a full rebuild
//! - `fwb clean <module>...` - Remove only the listed modules' outputs and records

use crate::config::BuildSettings;
use crate::fingerprint::{DiskStore, FingerprintStore};
use crate::target::TargetId;
use anyhow::{Context, Result};
use colored::*;
use std::fs;

pub fn clean(settings: &BuildSettings, cache_only: bool, targets: &[TargetId]) -> Result<()> {
    let mut cleaned = false;

    // 1. Selected targets only
    if !targets.is_empty() {
        let store = DiskStore::new(&settings.cache_dir);
        for id in targets {
            store
                .invalidate(id)
                .with_context(|| format!("Failed to drop fingerprint for {}", id))?;
            let out = settings.output_dir.join(id.slug());
            if !cache_only && out.exists() {
                fs::remove_dir_all(&out)
                    .with_context(|| format!("Failed to remove {}", out.display()))?;
            }
            println!("{} Cleaned {}", "🗑️".red(), id);
        }
        return Ok(());
    }

    // 2. Fingerprint cache
    if settings.cache_dir.exists() {
        fs::remove_dir_all(&settings.cache_dir).with_context(|| {
            format!(
                "Failed to remove cache directory {}",
                settings.cache_dir.display()
            )
        })?;
        cleaned = true;
    }

    // 3. Everything else
    if !cache_only && settings.output_dir.exists() {
        fs::remove_dir_all(&settings.output_dir).with_context(|| {
            format!(
                "Failed to remove output directory {}",
                settings.output_dir.display()
            )
        })?;
        cleaned = true;
    }

    if cleaned {
        println!("{} Clean complete.", "✓".green());
    } else {
        println!("{} Nothing to clean", "!".yellow());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(root: &std::path::Path) -> BuildSettings {
        BuildSettings {
            output_dir: root.join("build"),
            cache_dir: root.join("build/.fwcache"),
            ..Default::default()
        }
    }

    #[test]
    fn test_cache_only_keeps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        fs::create_dir_all(&s.cache_dir).unwrap();
        fs::create_dir_all(s.output_dir.join("app__m4")).unwrap();

        clean(&s, true, &[]).unwrap();
        assert!(!s.cache_dir.exists());
        assert!(s.output_dir.join("app__m4").exists());

        clean(&s, false, &[]).unwrap();
        assert!(!s.output_dir.exists());
    }

    #[test]
    fn test_clean_single_target() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        fs::create_dir_all(s.output_dir.join("app__m4")).unwrap();
        fs::create_dir_all(s.output_dir.join("hal__m4")).unwrap();

        clean(&s, false, &[TargetId::new("app", "m4")]).unwrap();
        assert!(!s.output_dir.join("app__m4").exists());
        assert!(s.output_dir.join("hal__m4").exists());
    }
}
