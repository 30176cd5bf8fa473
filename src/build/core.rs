use super::builder::{CommandBuilder, TargetBuilder};
use super::feedback::{Manager, ProtocolError};
use super::queue::{QueueItem, TaskQueue};
use super::report::BuildReport;
use super::worker::{Worker, WorkerContext, WorkerStats};
use crate::config::{BuildSettings, FwConfig, LogLevel, QueueEnd};
use crate::deps::IntermediateMap;
use crate::fingerprint::{DiskStore, FingerprintStore};
use crate::log::{ConsoleSink, FileSink, LogAggregator, LogSink, Logger};
use crate::resolve::{ManifestResolver, MetadataResolver, resolve_sources, targets_from_config};
use crate::target::{BuildTarget, TargetId};
use anyhow::{Context, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

/// Scheduler failures that are not build failures.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid build settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("feedback manager panicked")]
    ManagerPanicked,
}

/// Everything a run needs, passed in explicitly.
pub struct BuildContext<'a> {
    pub settings: &'a BuildSettings,
    pub store: &'a dyn FingerprintStore,
    pub builder: &'a dyn TargetBuilder,
    pub resolver: &'a dyn MetadataResolver,
    pub intermediates: &'a IntermediateMap,
    pub logger: &'a Logger,
    pub progress: Option<ProgressBar>,
}

// --- CORE: Run Build ---
/// Schedule `targets` over `settings.jobs` workers and wait for the pool to
/// drain.
///
/// Build failures are data in the returned report. Only scheduler defects are
/// errors.
pub fn run_build(
    targets: Vec<BuildTarget>,
    ctx: &BuildContext<'_>,
) -> Result<BuildReport, ScheduleError> {
    let settings = ctx.settings;
    settings.validate().map_err(ScheduleError::InvalidSettings)?;

    let start = Instant::now();
    let jobs = settings.jobs;
    let all: BTreeSet<TargetId> = targets.iter().map(|t| t.id.clone()).collect();
    let logger = ctx.logger.named("controller");
    logger.verbose(format!(
        "scheduling {} targets on {} workers",
        all.len(),
        jobs
    ));

    let queue = TaskQueue::new(settings.queue_capacity);
    let terminate = AtomicBool::new(false);
    let (feedback_tx, feedback_rx) = mpsc::sync_channel(settings.channel_capacity);
    let (cache_tx, cache_rx) = mpsc::sync_channel(settings.channel_capacity);
    let wctx = WorkerContext {
        queue: &queue,
        store: ctx.store,
        builder: ctx.builder,
        resolver: ctx.resolver,
        intermediates: ctx.intermediates,
        settings,
        terminate: &terminate,
    };

    let (manager_result, worker_results) = thread::scope(|s| {
        let mut manager = Manager::new(jobs, &terminate, ctx.logger.named("manager"));
        if let Some(pb) = &ctx.progress {
            manager = manager.with_progress(pb.clone());
        }
        let poll = settings.poll_interval;
        let manager_handle = s.spawn(move || manager.run(feedback_rx, cache_rx, poll));

        let handles: Vec<_> = (0..jobs)
            .map(|i| {
                let worker = Worker::new(
                    i,
                    wctx,
                    ctx.logger.clone(),
                    feedback_tx.clone(),
                    cache_tx.clone(),
                );
                s.spawn(move || worker.run())
            })
            .collect();
        drop(feedback_tx);
        drop(cache_tx);

        populate(&queue, targets, &terminate, settings, &logger);

        let manager_result = manager_handle.join();
        if manager_result.is_err() {
            terminate.store(true, Ordering::Release);
        }
        let worker_results: Vec<thread::Result<WorkerStats>> =
            handles.into_iter().map(|h| h.join()).collect();
        (manager_result, worker_results)
    });

    let leftover = queue.drain_remaining().len();
    if leftover > 0 {
        logger.verbose(format!("{} queued items never started", leftover));
    }

    let outcome = match manager_result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ScheduleError::ManagerPanicked),
    };

    let mut report = BuildReport {
        crashed_workers: outcome.crashed_workers,
        ..Default::default()
    };
    for (i, result) in worker_results.into_iter().enumerate() {
        match result {
            Ok(stats) => {
                report.generated += stats.generated;
                report.compiled += stats.compiled;
            }
            Err(_) => {
                report.crashed_workers.insert(i);
            }
        }
    }
    report.not_attempted = all
        .into_iter()
        .filter(|id| !outcome.done.contains(id) && !outcome.failed.contains(id))
        .collect();
    report.succeeded = outcome.done;
    report.failed = outcome.failed;
    report.verdicts = outcome.verdicts;
    report.elapsed = start.elapsed();
    Ok(report)
}

/// Feed the queue, then signal the end of work. Stops early once the run is
/// terminating; whatever was not queued is reported as not attempted.
fn populate(
    queue: &TaskQueue,
    targets: Vec<BuildTarget>,
    terminate: &AtomicBool,
    settings: &BuildSettings,
    logger: &Logger,
) {
    let poll = settings.poll_interval;
    for target in targets {
        let id = target.id.clone();
        if let Err(e) = queue.push(QueueItem::Target(target), terminate, poll) {
            logger.verbose(format!("stopped queueing at {}: {}", id, e));
            break;
        }
    }
    match settings.queue_end {
        QueueEnd::Sentinel => {
            for _ in 0..settings.jobs {
                if queue.push(QueueItem::NoMoreWork, terminate, poll).is_err() {
                    break;
                }
            }
        }
        QueueEnd::Close => queue.close(),
    }
}

/// Derivation table for a run: explicit `[intermediates]` pairs plus one
/// template rule per target.
pub fn intermediate_map(
    config: &FwConfig,
    targets: &[BuildTarget],
    resolver: &dyn MetadataResolver,
    settings: &BuildSettings,
    root: &Path,
) -> IntermediateMap {
    let mut map = IntermediateMap::new();
    for (output, input) in &config.intermediates {
        map.insert(root.join(output), root.join(input));
    }
    let suffixes = config
        .generator
        .as_ref()
        .map(|g| g.template_suffixes.as_slice())
        .unwrap_or_default();
    if !suffixes.is_empty() {
        for target in targets {
            // Errors surface again on the worker, which reports the target.
            if let Ok(sources) = resolve_sources(resolver, target) {
                let gen_dir = settings.output_dir.join(target.id.slug()).join("gen");
                map.add_template_rule(sources, suffixes, &gen_dir);
            }
        }
    }
    map
}

/// Options the CLI layers over the config file.
#[derive(Debug, Default, Clone)]
pub struct BuildOptions {
    /// Only build targets whose module matches one of these.
    pub modules: Vec<String>,
    pub arch: Option<String>,
    pub profile: Option<String>,
}

fn select(targets: Vec<BuildTarget>, options: &BuildOptions) -> Vec<BuildTarget> {
    targets
        .into_iter()
        .filter(|t| options.modules.is_empty() || options.modules.contains(&t.id.module))
        .filter(|t| options.arch.as_ref().is_none_or(|a| *a == t.id.arch))
        .collect()
}

/// Settings paths are relative to the project directory.
pub fn root_settings(mut settings: BuildSettings, project_dir: &Path) -> BuildSettings {
    settings.output_dir = project_dir.join(&settings.output_dir);
    settings.cache_dir = project_dir.join(&settings.cache_dir);
    settings.log_file = settings.log_file.map(|f| project_dir.join(f));
    settings
}

// --- COMMAND: Build Project ---
pub fn build_project(
    project_dir: &Path,
    config: &FwConfig,
    settings: BuildSettings,
    options: &BuildOptions,
) -> Result<BuildReport> {
    let settings = root_settings(settings, project_dir);
    let targets = select(targets_from_config(config, project_dir)?, options);
    if targets.is_empty() {
        anyhow::bail!("No targets match the selection");
    }

    println!(
        "{} Building {} ({} targets, {} workers)",
        "🚀".blue(),
        config.project.name.bold(),
        targets.len(),
        settings.jobs
    );

    let pb = if settings.log_level > LogLevel::Error {
        let pb = ProgressBar::new(targets.len() as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut sinks: Vec<Box<dyn LogSink>> = vec![Box::new(ConsoleSink::new(Some(pb.clone())))];
    if let Some(path) = &settings.log_file {
        sinks.push(Box::new(FileSink::create(path)?));
    }
    let (logger, aggregator) =
        LogAggregator::spawn(settings.log_level, sinks, settings.channel_capacity);

    let mut resolver = ManifestResolver::from_config(config);
    if let Some(profile) = &options.profile {
        resolver = resolver.with_profile(profile);
    }
    let store = DiskStore::new(&settings.cache_dir);
    let builder = CommandBuilder::from_config(project_dir, config);
    let intermediates = intermediate_map(config, &targets, &resolver, &settings, project_dir);
    logger.verbose(format!("{} intermediate derivations", intermediates.len()));

    let ctx = BuildContext {
        settings: &settings,
        store: &store,
        builder: &builder,
        resolver: &resolver,
        intermediates: &intermediates,
        logger: &logger,
        progress: Some(pb),
    };
    let result = run_build(targets, &ctx);
    drop(ctx);
    aggregator.finish(logger);

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CONFIG: &str = r#"
[project]
name = "fw"

[generator]
command = "true"
template_suffixes = [".in"]

[intermediates]
"gen/startup.s" = "hal/startup.S"

[[target]]
module = "uart"
arch = "m4"

[[target]]
module = "spi"
arch = "m4"

[[target]]
module = "spi"
arch = "rv32"
"#;

    #[test]
    fn test_select_by_module_and_arch() {
        let cfg: FwConfig = toml::from_str(CONFIG).unwrap();
        let targets = targets_from_config(&cfg, Path::new("/fw")).unwrap();
        let options = BuildOptions {
            modules: vec!["spi".into()],
            arch: Some("rv32".into()),
            profile: None,
        };
        let picked = select(targets, &options);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, TargetId::new("spi", "rv32"));
    }

    #[test]
    fn test_intermediate_map_from_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("uart")).unwrap();
        fs::write(dir.path().join("uart/uart.c"), "").unwrap();
        fs::write(dir.path().join("uart/cfg.h.in"), "").unwrap();

        let cfg: FwConfig = toml::from_str(CONFIG).unwrap();
        let targets = targets_from_config(&cfg, dir.path()).unwrap();
        let resolver = ManifestResolver::from_config(&cfg);
        let settings = root_settings(BuildSettings::default(), dir.path());
        let map = intermediate_map(&cfg, &targets[..1], &resolver, &settings, dir.path());

        assert_eq!(map.len(), 2);
        let generated = settings.output_dir.join("uart__m4/gen/cfg.h");
        assert_eq!(map.origin(&generated), dir.path().join("uart/cfg.h.in"));
        assert!(map.is_intermediate(&dir.path().join("gen/startup.s")));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = BuildSettings {
            jobs: 0,
            ..Default::default()
        };
        let store = crate::fingerprint::MemoryStore::new();
        let builder = CommandBuilder::new("/fw", None, None);
        let cfg: FwConfig = toml::from_str(CONFIG).unwrap();
        let resolver = ManifestResolver::from_config(&cfg);
        let map = IntermediateMap::new();
        let logger = Logger::discard();
        let ctx = BuildContext {
            settings: &settings,
            store: &store,
            builder: &builder,
            resolver: &resolver,
            intermediates: &map,
            logger: &logger,
            progress: None,
        };
        assert!(matches!(
            run_build(Vec::new(), &ctx),
            Err(ScheduleError::InvalidSettings(_))
        ));
    }
}
