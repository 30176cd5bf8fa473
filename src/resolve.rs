//! Metadata resolution: turning `fwbuild.toml` into build targets, their
//! ordered source lists and their build configuration.

use crate::config::FwConfig;
use crate::target::{BuildConfig, BuildTarget, TargetId};
use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions picked up when a target does not list its sources.
const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "s", "S", "asm"];

/// Supplies a target's sources and configuration. Resolved once per target,
/// before any cache lookup.
pub trait MetadataResolver: Send + Sync {
    fn sources(&self, target: &BuildTarget) -> Result<Vec<PathBuf>>;
    fn build_config(&self, target: &BuildTarget) -> Result<BuildConfig>;
}

struct TargetOverrides {
    defines: BTreeMap<String, String>,
    flags: Vec<String>,
}

/// Resolver backed by the project config file.
pub struct ManifestResolver {
    profile: String,
    defines: BTreeMap<String, String>,
    flags: Vec<String>,
    template_suffixes: Vec<String>,
    overrides: HashMap<TargetId, TargetOverrides>,
}

impl ManifestResolver {
    pub fn from_config(config: &FwConfig) -> Self {
        let overrides = config
            .targets
            .iter()
            .map(|t| {
                (
                    TargetId::new(&t.module, &t.arch),
                    TargetOverrides {
                        defines: t.defines.clone(),
                        flags: t.flags.clone(),
                    },
                )
            })
            .collect();
        Self {
            profile: config.project.profile.clone(),
            defines: config.project.defines.clone(),
            flags: config.project.flags.clone(),
            template_suffixes: config
                .generator
                .as_ref()
                .map(|g| g.template_suffixes.clone())
                .unwrap_or_default(),
            overrides,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    fn is_source(&self, path: &Path) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if self
            .template_suffixes
            .iter()
            .any(|s| name.len() > s.len() && name.ends_with(s.as_str()))
        {
            return true;
        }
        path.extension()
            .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e.to_string_lossy().as_ref()))
    }
}

impl MetadataResolver for ManifestResolver {
    /// Explicit sources keep their declared order. Discovered sources are
    /// sorted so the order is reproducible across machines.
    fn sources(&self, target: &BuildTarget) -> Result<Vec<PathBuf>> {
        if let Some(explicit) = &target.explicit_sources {
            return Ok(explicit
                .iter()
                .map(|s| {
                    if s.is_absolute() {
                        s.clone()
                    } else {
                        target.source_root.join(s)
                    }
                })
                .collect());
        }

        let dir = target.module_dir();
        if !dir.is_dir() {
            bail!("Module directory {} does not exist", dir.display());
        }
        let mut sources: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| self.is_source(p))
            .collect();
        sources.sort();
        Ok(sources)
    }

    fn build_config(&self, target: &BuildTarget) -> Result<BuildConfig> {
        let mut defines = self.defines.clone();
        let mut flags = self.flags.clone();
        if let Some(o) = self.overrides.get(&target.id) {
            defines.extend(o.defines.clone());
            flags.extend(o.flags.iter().cloned());
        }
        defines.insert("FW_ARCH".to_string(), target.id.arch.clone());
        if target.is_library {
            defines.insert("FW_LIBRARY".to_string(), "1".to_string());
        }
        Ok(BuildConfig {
            profile: self.profile.clone(),
            defines,
            flags,
        })
    }
}

/// Build the target list declared in the config. Duplicate identities are an
/// error: two workers must never own the same cache key.
pub fn targets_from_config(config: &FwConfig, root: &Path) -> Result<Vec<BuildTarget>> {
    let source_root = match &config.project.source_root {
        Some(r) if r.is_absolute() => r.clone(),
        Some(r) => root.join(r),
        None => root.to_path_buf(),
    };

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(config.targets.len());
    for t in &config.targets {
        let id = TargetId::new(&t.module, &t.arch);
        if !seen.insert(id.clone()) {
            bail!("Target {} is declared more than once", id);
        }
        let mut target = BuildTarget::new(id, &source_root, &t.module)
            .library(t.library)
            .with_metadata(t.metadata.iter().map(|m| source_root.join(m)).collect());
        if let Some(name) = &t.name {
            target = target.with_name(name);
        }
        if let Some(sources) = &t.sources {
            target = target.with_sources(sources.clone());
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Resolve the source list on the target (once) and return it.
pub fn resolve_sources<'t>(
    resolver: &dyn MetadataResolver,
    target: &'t BuildTarget,
) -> Result<&'t [PathBuf]> {
    target
        .resolve_sources(|t| resolver.sources(t))
        .with_context(|| format!("Failed to resolve sources for {}", target.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(toml_str: &str) -> FwConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_discovered_sources_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let m = dir.path().join("drivers/spi");
        fs::create_dir_all(m.join("sub")).unwrap();
        fs::write(m.join("z.c"), "").unwrap();
        fs::write(m.join("a.S"), "").unwrap();
        fs::write(m.join("sub/b.cpp"), "").unwrap();
        fs::write(m.join("regs.h.in"), "").unwrap();
        fs::write(m.join("README.md"), "").unwrap();

        let cfg = config(
            r#"
[project]
name = "fw"
[generator]
command = "true"
template_suffixes = [".in"]
[[target]]
module = "drivers/spi"
arch = "m4"
"#,
        );
        let targets = targets_from_config(&cfg, dir.path()).unwrap();
        let resolver = ManifestResolver::from_config(&cfg);
        let sources = resolve_sources(&resolver, &targets[0]).unwrap();
        let names: Vec<_> = sources
            .iter()
            .map(|p| p.strip_prefix(&m).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.S"),
                PathBuf::from("regs.h.in"),
                PathBuf::from("sub/b.cpp"),
                PathBuf::from("z.c"),
            ]
        );
    }

    #[test]
    fn test_explicit_sources_keep_order() {
        let cfg = config(
            r#"
[project]
name = "fw"
[[target]]
module = "app"
arch = "m4"
sources = ["app/z.c", "app/a.c"]
"#,
        );
        let targets = targets_from_config(&cfg, Path::new("/fw")).unwrap();
        let resolver = ManifestResolver::from_config(&cfg);
        let sources = resolve_sources(&resolver, &targets[0]).unwrap();
        assert_eq!(
            sources,
            &[PathBuf::from("/fw/app/z.c"), PathBuf::from("/fw/app/a.c")]
        );
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let cfg = config(
            r#"
[project]
name = "fw"
[[target]]
module = "app"
arch = "m4"
[[target]]
module = "app"
arch = "m4"
"#,
        );
        assert!(targets_from_config(&cfg, Path::new("/fw")).is_err());
    }

    #[test]
    fn test_build_config_merges_overrides() {
        let cfg = config(
            r#"
[project]
name = "fw"
profile = "release"
defines = { BOARD = "nucleo", LOG = "1" }
flags = ["-Os"]
[[target]]
module = "app"
arch = "m4"
library = true
defines = { LOG = "0" }
flags = ["-g"]
"#,
        );
        let targets = targets_from_config(&cfg, Path::new("/fw")).unwrap();
        let bc = ManifestResolver::from_config(&cfg)
            .build_config(&targets[0])
            .unwrap();
        assert_eq!(bc.profile, "release");
        assert_eq!(bc.defines["LOG"], "0");
        assert_eq!(bc.defines["BOARD"], "nucleo");
        assert_eq!(bc.defines["FW_ARCH"], "m4");
        assert_eq!(bc.defines["FW_LIBRARY"], "1");
        assert_eq!(bc.flags, vec!["-Os", "-g"]);
    }

    #[test]
    fn test_missing_module_dir_is_error() {
        let cfg = config(
            r#"
[project]
name = "fw"
[[target]]
module = "nope"
arch = "m4"
"#,
        );
        let dir = tempfile::tempdir().unwrap();
        let targets = targets_from_config(&cfg, dir.path()).unwrap();
        let resolver = ManifestResolver::from_config(&cfg);
        assert!(resolve_sources(&resolver, &targets[0]).is_err());
    }
}
