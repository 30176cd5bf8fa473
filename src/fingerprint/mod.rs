//! Fingerprint cache: the two skip points of a build target.
//!
//! - [`store`] - persistent per-target records (disk and in-memory)
//! - [`engine`] - pre- and post-generation hit computation
//! - [`error`] - [`CacheError`]
//!
//! Every cache error degrades to a miss. That rule lives in [`hit_or_miss`]
//! and nowhere else.

pub mod engine;
pub mod error;
pub mod store;

pub use engine::{CacheEngine, FingerprintInputs, hash_bytes};
pub use error::CacheError;
pub use store::{DiskStore, FingerprintRecord, FingerprintStore, MemoryStore, RECORD_VERSION};

use crate::log::Logger;

/// Collapse a cache computation into a verdict. Errors are logged as
/// warnings and count as a miss, never a hit.
pub fn hit_or_miss(result: Result<bool, CacheError>, logger: &Logger, context: &str) -> bool {
    match result {
        Ok(hit) => hit,
        Err(e) => {
            logger.warn(format!("{}: {} (treating as cache miss)", context, e));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::log::{LogAggregator, MemorySink};
    use std::path::PathBuf;

    #[test]
    fn test_errors_are_misses() {
        let logger = Logger::discard();
        assert!(hit_or_miss(Ok(true), &logger, "pre-gen"));
        assert!(!hit_or_miss(Ok(false), &logger, "pre-gen"));
        assert!(!hit_or_miss(
            Err(CacheError::Corrupt {
                path: PathBuf::from("x.json"),
                reason: "eof".into(),
            }),
            &logger,
            "pre-gen",
        ));
    }

    #[test]
    fn test_error_is_logged_as_warning() {
        let sink = MemorySink::new();
        let (logger, agg) = LogAggregator::spawn(LogLevel::Info, vec![Box::new(sink.clone())], 4);
        hit_or_miss(Err(CacheError::Poisoned), &logger, "app@m4 pre-gen");
        agg.finish(logger);
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[warn] app@m4 pre-gen"));
        assert!(lines[0].contains("treating as cache miss"));
    }
}
