//! The worker loop.
//!
//! A worker owns every target it pops until it reports `Done` or `Failed` for
//! it. Per-target errors are reported as data; only a panic takes a worker
//! down, and even then its exit guard still reports the exit and the target
//! that was in flight.

use super::builder::{TargetBuilder, diagnose};
use super::feedback::FeedbackMessage;
use super::queue::{Pop, QueueItem, TaskQueue};
use super::report::{CachePhase, CacheVerdict};
use crate::config::BuildSettings;
use crate::deps::{DependencyRecord, DependencyTracker, IntermediateMap};
use crate::fingerprint::{CacheEngine, FingerprintInputs, FingerprintStore, hit_or_miss};
use crate::log::Logger;
use crate::resolve::{MetadataResolver, resolve_sources};
use crate::target::{BuildTarget, TargetId};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;

/// Shared, read-only collaborators. Every worker gets the same set.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub queue: &'a TaskQueue,
    pub store: &'a dyn FingerprintStore,
    pub builder: &'a dyn TargetBuilder,
    pub resolver: &'a dyn MetadataResolver,
    pub intermediates: &'a IntermediateMap,
    pub settings: &'a BuildSettings,
    pub terminate: &'a AtomicBool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub generated: usize,
    pub compiled: usize,
}

/// Sends `WorkerExit` when dropped, including during unwinding.
struct ExitGuard {
    worker: usize,
    in_flight: Option<TargetId>,
    feedback: SyncSender<FeedbackMessage>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.feedback.send(FeedbackMessage::WorkerExit {
            worker: self.worker,
            in_flight: self.in_flight.take(),
            panicked: std::thread::panicking(),
        });
    }
}

pub struct Worker<'a> {
    index: usize,
    ctx: WorkerContext<'a>,
    logger: Logger,
    feedback: SyncSender<FeedbackMessage>,
    cache: SyncSender<CacheVerdict>,
}

impl<'a> Worker<'a> {
    pub fn new(
        index: usize,
        ctx: WorkerContext<'a>,
        logger: Logger,
        feedback: SyncSender<FeedbackMessage>,
        cache: SyncSender<CacheVerdict>,
    ) -> Self {
        Self {
            index,
            ctx,
            logger: logger.named(format!("w{}", index)),
            feedback,
            cache,
        }
    }

    // A gone manager means the run is over; nothing useful to do with the error.
    fn send(&self, msg: FeedbackMessage) {
        let _ = self.feedback.send(msg);
    }

    fn verdict(&self, id: &TargetId, phase: CachePhase, hit: bool) {
        let _ = self.cache.send(CacheVerdict {
            id: id.clone(),
            phase,
            hit,
        });
    }

    pub fn run(self) -> WorkerStats {
        let mut guard = ExitGuard {
            worker: self.index,
            in_flight: None,
            feedback: self.feedback.clone(),
        };
        let mut stats = WorkerStats::default();
        let mut starved = 0u32;
        let settings = self.ctx.settings;

        loop {
            if self.ctx.terminate.load(Ordering::Acquire) {
                self.logger.verbose("termination requested, exiting");
                break;
            }
            match self.ctx.queue.try_pop(settings.poll_interval) {
                Pop::Empty => {
                    starved += 1;
                    if starved >= settings.starvation_limit {
                        self.logger.warn(format!(
                            "queue empty for {} polls, still waiting for work",
                            starved
                        ));
                        starved = 0;
                    }
                }
                Pop::Closed | Pop::Item(QueueItem::NoMoreWork) => {
                    self.send(FeedbackMessage::QueueExhausted { worker: self.index });
                    break;
                }
                Pop::Item(QueueItem::Target(target)) => {
                    starved = 0;
                    guard.in_flight = Some(target.id.clone());
                    stats.processed += 1;
                    let msg = match self.process(&target, &mut stats) {
                        Ok(()) => FeedbackMessage::Done(target.id.clone()),
                        Err(e) => {
                            self.fail(&target, &e);
                            FeedbackMessage::Failed(target.id.clone())
                        }
                    };
                    self.send(msg);
                    guard.in_flight = None;
                }
            }
        }
        stats
    }

    fn fail(&self, target: &BuildTarget, err: &anyhow::Error) {
        let detail = format!("{:#}", err);
        self.logger.error(format!("{} failed: {}", target.id, detail));
        if let Some(hint) = diagnose(&detail) {
            self.logger.info(hint);
        }
        if let Err(e) = CacheEngine::new(self.ctx.store).invalidate(&target.id) {
            self.logger
                .warn(format!("could not invalidate record for {}: {}", target.id, e));
        }
    }

    fn process(&self, target: &BuildTarget, stats: &mut WorkerStats) -> Result<()> {
        let ctx = &self.ctx;
        let id = &target.id;

        let sources = resolve_sources(ctx.resolver, target)?;
        let config = ctx
            .resolver
            .build_config(target)
            .with_context(|| format!("Failed to resolve build configuration for {}", id))?;
        let inputs = FingerprintInputs {
            id,
            config: &config,
            sources,
            metadata: &target.metadata_files,
        };
        let engine = CacheEngine::new(ctx.store);

        let previous = match engine.load_previous(id) {
            Ok(record) => record,
            Err(e) => {
                // An unreadable record counts as no record.
                hit_or_miss(Err(e), &self.logger, &format!("{} record", id));
                None
            }
        };

        if ctx.settings.pre_gen_cache {
            let hit = hit_or_miss(
                engine.pre_gen_hit(&inputs, previous.as_ref()),
                &self.logger,
                &format!("{} pre-gen", id),
            );
            self.verdict(id, CachePhase::PreGen, hit);
            if hit {
                self.logger.verbose(format!("{} up to date", id));
                return Ok(());
            }
        }

        let out_dir = ctx.settings.output_dir.join(id.slug());
        self.logger.info(format!("Generating {}", id));
        let generated = ctx.builder.generate(target, &config, &out_dir)?;
        stats.generated += 1;

        let tracker = DependencyTracker::new(ctx.intermediates);
        let history = engine.previous_dependencies(&inputs, previous.as_ref());
        let gen_deps = tracker.merge(history.clone(), tracker.consolidate(&generated.traces));

        if ctx.settings.post_gen_cache {
            let hit = hit_or_miss(
                engine.post_gen_hit(&inputs, &gen_deps, &generated.files, previous.as_ref()),
                &self.logger,
                &format!("{} post-gen", id),
            );
            self.verdict(id, CachePhase::PostGen, hit);
            if hit {
                self.logger
                    .verbose(format!("{} generated output unchanged, skipping compile", id));
                self.commit(&engine, &inputs, gen_deps, generated.files);
                return Ok(());
            }
        }

        self.logger.info(format!("Compiling {}", id));
        let compile_traces = ctx.builder.compile(target, &config, &generated, &out_dir)?;
        stats.compiled += 1;

        let mut traces = generated.traces;
        traces.extend(compile_traces);
        let deps = tracker.merge(history, tracker.consolidate(&traces));
        self.commit(&engine, &inputs, deps, generated.files);
        Ok(())
    }

    /// A failed commit leaves the target built but uncached.
    fn commit(
        &self,
        engine: &CacheEngine<'_>,
        inputs: &FingerprintInputs<'_>,
        deps: Vec<DependencyRecord>,
        generated: Vec<PathBuf>,
    ) {
        if let Err(e) = engine.commit(inputs, deps, generated) {
            self.logger
                .warn(format!("could not record fingerprint for {}: {}", inputs.id, e));
            let _ = engine.invalidate(inputs.id);
        }
    }
}
