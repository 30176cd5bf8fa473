//! Dependency tracking.
//!
//! Turns compiler include traces into consolidated per-source dependency
//! records, which feed both the incremental-build rules and the fingerprint
//! cache.
//!
//! - [`trace`] - parsers for `.d` sidecar files and `/showIncludes` output
//! - [`tracker`] - intermediate-file folding, transitive closure, history

pub mod trace;
pub mod tracker;

pub use trace::{RawTrace, parse_make_deps, parse_show_includes, read_make_deps};
pub use tracker::{
    DependencyRecord, DependencyTracker, IntermediateMap, flatten, make_rule, retain_current,
};
