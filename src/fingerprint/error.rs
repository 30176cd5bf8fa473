//! Error types for the fingerprint store and cache engine.

use std::path::PathBuf;

/// Errors raised while reading, writing or computing fingerprints.
///
/// None of these are fatal to a build. The worker maps every one of them to
/// a cache miss through [`crate::fingerprint::hit_or_miss`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing store files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The record could not be parsed.
    #[error("corrupt fingerprint record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The record was written by an incompatible schema.
    #[error("fingerprint record {path} has version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// The record on disk belongs to a different target.
    #[error("fingerprint record {path} belongs to {found}, not {expected}")]
    IdentityMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// A fingerprint input could not be read.
    #[error("failed to hash {path}: {source}")]
    Hash {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The record could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// An in-memory store's lock was poisoned by a panicking worker.
    #[error("fingerprint store lock poisoned")]
    Poisoned,
}
