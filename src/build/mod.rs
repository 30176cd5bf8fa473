//! Parallel build scheduling.
//!
//! - [`queue`] - bounded task queue
//! - [`worker`] - per-target cache/generate/compile loop
//! - [`feedback`] - the manager and its drain state machine
//! - [`core`] - the controller (`run_build`) and the CLI entry point
//! - [`builder`] - the generate/compile collaborator

pub mod builder;
mod clean;
pub mod core;
pub mod feedback;
pub mod queue;
pub mod report;
mod utils;
mod watcher;
pub mod worker;

pub use builder::{CommandBuilder, GeneratedFileSet, TargetBuilder};
pub use clean::clean;
pub use self::core::{
    BuildContext, BuildOptions, ScheduleError, build_project, root_settings, run_build,
};
pub use feedback::{FeedbackMessage, Manager, ManagerState, ProtocolError};
pub use queue::{Pop, QueueError, QueueItem, TaskQueue};
pub use report::{BuildReport, CachePhase, CacheVerdict};
pub use utils::{CONFIG_FILE, load_config};
pub use watcher::watch;
pub use worker::{Worker, WorkerContext, WorkerStats};
