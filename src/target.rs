//! Build targets: the unit of schedulable work.
//!
//! A target is identified by its `(module, arch)` pair. That identity is the
//! cache key, so it must be stable across runs and must never encode anything
//! run-specific (timestamps, worker indices, absolute temp paths).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Stable identity of a build target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub module: String,
    pub arch: String,
}

impl TargetId {
    pub fn new(module: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            arch: arch.into(),
        }
    }

    /// Filesystem-safe name, used for per-target directories and store files.
    pub fn slug(&self) -> String {
        let clean = |s: &str| {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };
        format!("{}__{}", clean(&self.module), clean(&self.arch))
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.arch)
    }
}

/// Per-target build configuration.
///
/// Everything here is part of the fingerprint, so maps are ordered to keep the
/// serialized form deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub profile: String,
    #[serde(default)]
    pub defines: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// One unit of work handed to a worker.
///
/// Immutable once enqueued. The source list is resolved lazily (on the worker
/// that owns the target) and never changes afterwards.
#[derive(Debug)]
pub struct BuildTarget {
    pub id: TargetId,
    pub name: String,
    pub source_root: PathBuf,
    pub rel_path: PathBuf,
    pub is_library: bool,
    pub metadata_files: Vec<PathBuf>,
    pub explicit_sources: Option<Vec<PathBuf>>,
    sources: OnceLock<Vec<PathBuf>>,
}

impl BuildTarget {
    pub fn new(
        id: TargetId,
        source_root: impl Into<PathBuf>,
        rel_path: impl Into<PathBuf>,
    ) -> Self {
        let rel_path = rel_path.into();
        let name = rel_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| id.module.clone());
        Self {
            id,
            name,
            source_root: source_root.into(),
            rel_path,
            is_library: false,
            metadata_files: Vec::new(),
            explicit_sources: None,
            sources: OnceLock::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn library(mut self, is_library: bool) -> Self {
        self.is_library = is_library;
        self
    }

    pub fn with_metadata(mut self, files: Vec<PathBuf>) -> Self {
        self.metadata_files = files;
        self
    }

    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.explicit_sources = Some(sources);
        self
    }

    /// Absolute directory of the module.
    pub fn module_dir(&self) -> PathBuf {
        self.source_root.join(&self.rel_path)
    }

    /// The resolved source list, if it has been resolved already.
    pub fn sources(&self) -> Option<&[PathBuf]> {
        self.sources.get().map(Vec::as_slice)
    }

    /// Resolve the source list once. Later calls return the first result.
    pub fn resolve_sources<F, E>(&self, resolve: F) -> Result<&[PathBuf], E>
    where
        F: FnOnce(&BuildTarget) -> Result<Vec<PathBuf>, E>,
    {
        if let Some(sources) = self.sources.get() {
            return Ok(sources);
        }
        let resolved = resolve(self)?;
        Ok(self.sources.get_or_init(|| resolved))
    }

    pub fn contains_source(&self, path: &Path) -> bool {
        self.sources()
            .is_some_and(|sources| sources.iter().any(|s| s == path))
    }
}
