//! Two-tier skip decisions.
//!
//! - **Pre-generation**: identity, build configuration, ordered sources,
//!   metadata files and the previous run's dependency contents are unchanged,
//!   and every previously generated output still exists. Generation is skipped.
//! - **Post-generation**: the same compile inputs plus the freshly generated
//!   files are unchanged. Compilation is skipped. Metadata files are not part
//!   of this tier, so a descriptor edit that regenerates identical output
//!   still avoids the compiler.

use super::error::CacheError;
use super::store::{FingerprintRecord, FingerprintStore, RECORD_VERSION};
use crate::deps::{DependencyRecord, flatten, retain_current};
use crate::target::{BuildConfig, TargetId};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Marker hashed in place of a file that does not exist.
const MISSING: &str = "<missing>";

/// Everything about a target the fingerprints are computed from.
pub struct FingerprintInputs<'a> {
    pub id: &'a TargetId,
    pub config: &'a BuildConfig,
    /// Order matters: it drives generated-artifact layout.
    pub sources: &'a [PathBuf],
    pub metadata: &'a [PathBuf],
}

pub struct CacheEngine<'s> {
    store: &'s dyn FingerprintStore,
}

impl<'s> CacheEngine<'s> {
    pub fn new(store: &'s dyn FingerprintStore) -> Self {
        Self { store }
    }

    pub fn load_previous(&self, id: &TargetId) -> Result<Option<FingerprintRecord>, CacheError> {
        self.store.load(id)
    }

    /// History usable for this run: records of sources, and of units the last
    /// generation produced, that are still part of the target.
    pub fn previous_dependencies(
        &self,
        inputs: &FingerprintInputs<'_>,
        previous: Option<&FingerprintRecord>,
    ) -> Vec<DependencyRecord> {
        previous
            .map(|r| retain_current(r.dependencies.clone(), inputs.sources, &r.generated))
            .unwrap_or_default()
    }

    pub fn pre_gen_hit(
        &self,
        inputs: &FingerprintInputs<'_>,
        previous: Option<&FingerprintRecord>,
    ) -> Result<bool, CacheError> {
        let Some(record) = previous else {
            return Ok(false);
        };
        if record.generated.iter().any(|p| !p.exists()) {
            return Ok(false);
        }
        let deps = self.previous_dependencies(inputs, Some(record));
        Ok(pre_gen_fingerprint(inputs, &deps)? == record.pre_gen)
    }

    pub fn post_gen_hit(
        &self,
        inputs: &FingerprintInputs<'_>,
        deps: &[DependencyRecord],
        generated: &[PathBuf],
        previous: Option<&FingerprintRecord>,
    ) -> Result<bool, CacheError> {
        let Some(stored) = previous.and_then(|r| r.post_gen.as_deref()) else {
            return Ok(false);
        };
        let deps = retain_current(deps.to_vec(), inputs.sources, generated);
        Ok(post_gen_fingerprint(inputs, &deps, generated)? == stored)
    }

    /// Store both tiers for a successful build. Records are filtered with the
    /// same rule the next run's lookup applies, so an unchanged target hits.
    pub fn commit(
        &self,
        inputs: &FingerprintInputs<'_>,
        deps: Vec<DependencyRecord>,
        generated: Vec<PathBuf>,
    ) -> Result<FingerprintRecord, CacheError> {
        let deps = retain_current(deps, inputs.sources, &generated);
        let record = FingerprintRecord {
            version: RECORD_VERSION,
            target: inputs.id.clone(),
            pre_gen: pre_gen_fingerprint(inputs, &deps)?,
            post_gen: Some(post_gen_fingerprint(inputs, &deps, &generated)?),
            dependencies: deps,
            generated,
        };
        self.store.save(&record)?;
        Ok(record)
    }

    pub fn invalidate(&self, id: &TargetId) -> Result<(), CacheError> {
        self.store.invalidate(id)
    }
}

pub fn pre_gen_fingerprint(
    inputs: &FingerprintInputs<'_>,
    deps: &[DependencyRecord],
) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    hasher.update(b"fwbuild-pre-gen\0");
    hash_common(&mut hasher, inputs)?;
    hash_section(&mut hasher, "metadata", inputs.metadata)?;
    hash_section(&mut hasher, "deps", &sorted_deps(deps))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn post_gen_fingerprint(
    inputs: &FingerprintInputs<'_>,
    deps: &[DependencyRecord],
    generated: &[PathBuf],
) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    hasher.update(b"fwbuild-post-gen\0");
    hash_common(&mut hasher, inputs)?;
    hash_section(&mut hasher, "deps", &sorted_deps(deps))?;
    let generated: Vec<PathBuf> = generated
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    hash_section(&mut hasher, "generated", &generated)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_common(hasher: &mut Sha256, inputs: &FingerprintInputs<'_>) -> Result<(), CacheError> {
    hasher.update(inputs.id.to_string().as_bytes());
    hasher.update(b"\0");
    let config = serde_json::to_string(inputs.config).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })?;
    hasher.update(config.as_bytes());
    hasher.update(b"\0");
    hash_section(hasher, "sources", inputs.sources)
}

fn sorted_deps(deps: &[DependencyRecord]) -> Vec<PathBuf> {
    flatten(deps)
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Hash a labelled list of files, in the given order. File contents are
/// hashed in parallel.
fn hash_section(hasher: &mut Sha256, label: &str, paths: &[PathBuf]) -> Result<(), CacheError> {
    let digests: Vec<String> = paths
        .par_iter()
        .map(|p| hash_file_or_missing(p))
        .collect::<Result<_, _>>()?;

    hasher.update(label.as_bytes());
    hasher.update(b"\0");
    for (path, digest) in paths.iter().zip(digests) {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(())
}

/// A deleted file is a change, not an error. Anything else unreadable is.
fn hash_file_or_missing(path: &Path) -> Result<String, CacheError> {
    match fs::read(path) {
        Ok(data) => Ok(hash_bytes(&data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(MISSING.to_string()),
        Err(e) => Err(CacheError::Hash {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// SHA-256 of a byte slice as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
