//! # fwbuild - Firmware Build Orchestration
//!
//! fwbuild schedules per-module firmware builds over a pool of workers and
//! skips work whose inputs have not changed.
//!
//! ## Features
//!
//! - **Two-Tier Cache**: skip generation when nothing changed, skip
//!   compilation when regeneration produced identical output
//! - **Recursive Dependency Tracking**: `.d` files and `/showIncludes` output,
//!   with generated intermediates folded back onto their origin
//! - **First-Failure Drain**: one failed target stops the pool cleanly, and the
//!   report tells failed targets apart from ones never attempted
//! - **Serialized Logging**: every worker logs through one aggregator thread
//!
//! ## Quick Start
//!
//! ```bash
//! # Build every target in fwbuild.toml
//! fwb build
//!
//! # Print the incremental-build rule for one module
//! fwb deps drivers/uart --arch cortex-m4
//! ```
//!
//! ## Module Organization
//!
//! - [`build`] - Task queue, workers, manager and controller
//! - [`fingerprint`] - Fingerprint store and cache engine
//! - [`deps`] - Include-trace parsing and consolidation
//! - [`config`] - Configuration parsing (`fwbuild.toml`)
//! - [`log`] - Log aggregation

/// Parallel build scheduling.
pub mod build;

/// Fingerprint cache management commands.
pub mod cache;

/// Configuration file parsing (`fwbuild.toml`).
pub mod config;

/// Include-trace parsing and dependency consolidation.
pub mod deps;

/// Fingerprint store and two-tier cache engine.
pub mod fingerprint;

/// Log aggregation.
pub mod log;

/// Target and source resolution from the config file.
pub mod resolve;

/// Build targets and their identities.
pub mod target;

/// Terminal UI utilities (tables, colors).
pub mod ui;
