//! Feedback aggregation.
//!
//! The manager is the single consumer of worker outcomes. It owns the
//! termination flag: the first failure, crash or exhausted-queue signal moves
//! it from `Running` to `Draining` and raises the flag. Once every worker has
//! reported its exit it drains both channels and ends in `Terminated`.

use super::report::CacheVerdict;
use crate::log::Logger;
use crate::target::TargetId;
use indicatif::ProgressBar;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Worker-to-manager message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackMessage {
    /// The target finished, from cache or by building.
    Done(TargetId),
    Failed(TargetId),
    /// The sending worker saw the end of work. Idempotent.
    QueueExhausted { worker: usize },
    /// Last message of every worker, sent on every exit path.
    WorkerExit {
        worker: usize,
        in_flight: Option<TargetId>,
        panicked: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Running,
    Draining,
    Terminated,
}

/// Tooling-internal failure. Indicates a defect, not a bad build input.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("second outcome reported for {0}")]
    DuplicateOutcome(TargetId),
    #[error("exit reported by unknown worker {0}")]
    UnknownWorker(usize),
    #[error("worker {0} reported its exit twice")]
    DuplicateExit(usize),
    #[error("feedback channel closed after {exited} of {expected} worker exits")]
    ChannelClosed { exited: usize, expected: usize },
}

/// What the manager collected over a run.
#[derive(Debug, Default)]
pub struct ManagerOutcome {
    pub done: BTreeSet<TargetId>,
    pub failed: BTreeSet<TargetId>,
    pub verdicts: BTreeSet<CacheVerdict>,
    pub crashed_workers: BTreeSet<usize>,
    pub exhausted_signals: usize,
}

pub struct Manager<'a> {
    worker_count: usize,
    terminate: &'a AtomicBool,
    state: ManagerState,
    exited: Vec<bool>,
    outcome: ManagerOutcome,
    violation: Option<ProtocolError>,
    logger: Logger,
    progress: Option<ProgressBar>,
}

impl<'a> Manager<'a> {
    pub fn new(worker_count: usize, terminate: &'a AtomicBool, logger: Logger) -> Self {
        Self {
            worker_count,
            terminate,
            state: ManagerState::Running,
            exited: vec![false; worker_count],
            outcome: ManagerOutcome::default(),
            violation: None,
            logger,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn outcome(&self) -> &ManagerOutcome {
        &self.outcome
    }

    pub fn violation(&self) -> Option<&ProtocolError> {
        self.violation.as_ref()
    }

    fn exited_count(&self) -> usize {
        self.exited.iter().filter(|e| **e).count()
    }

    pub fn all_exited(&self) -> bool {
        self.exited_count() == self.worker_count
    }

    fn begin_drain(&mut self, reason: &str) {
        self.terminate.store(true, Ordering::Release);
        if self.state == ManagerState::Running {
            self.logger.verbose(format!("draining: {}", reason));
            self.state = ManagerState::Draining;
        }
    }

    fn violate(&mut self, err: ProtocolError) {
        self.logger.error(format!("protocol violation: {}", err));
        self.begin_drain("protocol violation");
        if self.violation.is_none() {
            self.violation = Some(err);
        }
    }

    fn has_outcome(&self, id: &TargetId) -> bool {
        self.outcome.done.contains(id) || self.outcome.failed.contains(id)
    }

    fn tick(&self, id: &TargetId) {
        if let Some(pb) = &self.progress {
            pb.inc(1);
            pb.set_message(id.to_string());
        }
    }

    pub fn on_message(&mut self, msg: FeedbackMessage) {
        match msg {
            FeedbackMessage::Done(id) => {
                if self.has_outcome(&id) {
                    self.violate(ProtocolError::DuplicateOutcome(id));
                    return;
                }
                self.tick(&id);
                self.outcome.done.insert(id);
            }
            FeedbackMessage::Failed(id) => {
                if self.has_outcome(&id) {
                    self.violate(ProtocolError::DuplicateOutcome(id));
                    return;
                }
                self.tick(&id);
                self.begin_drain(&format!("{} failed", id));
                self.outcome.failed.insert(id);
            }
            FeedbackMessage::QueueExhausted { worker } => {
                self.outcome.exhausted_signals += 1;
                self.begin_drain(&format!("worker {} found the queue exhausted", worker));
            }
            FeedbackMessage::WorkerExit {
                worker,
                in_flight,
                panicked,
            } => {
                match self.exited.get_mut(worker) {
                    None => {
                        self.violate(ProtocolError::UnknownWorker(worker));
                        return;
                    }
                    Some(true) => {
                        self.violate(ProtocolError::DuplicateExit(worker));
                        return;
                    }
                    Some(seen) => *seen = true,
                }
                if panicked {
                    self.outcome.crashed_workers.insert(worker);
                    match in_flight {
                        Some(id) if !self.has_outcome(&id) => {
                            self.logger
                                .error(format!("worker {} crashed while building {}", worker, id));
                            self.tick(&id);
                            self.outcome.failed.insert(id);
                        }
                        _ => self.logger.error(format!("worker {} crashed", worker)),
                    }
                    self.begin_drain("worker crash");
                }
                if self.all_exited() && self.violation.is_none() {
                    self.state = ManagerState::Terminated;
                }
            }
        }
    }

    pub fn on_verdict(&mut self, verdict: CacheVerdict) {
        self.outcome.verdicts.insert(verdict);
    }

    fn drain_verdicts(&mut self, cache: &Receiver<CacheVerdict>) {
        while let Ok(verdict) = cache.try_recv() {
            self.on_verdict(verdict);
        }
    }

    /// Consume both channels until every worker has exited. The cache channel
    /// is emptied on every poll so no worker stalls on it.
    ///
    /// After a protocol violation the manager keeps consuming until all
    /// senders are gone, then reports the first violation.
    pub fn run(
        mut self,
        feedback: Receiver<FeedbackMessage>,
        cache: Receiver<CacheVerdict>,
        poll: Duration,
    ) -> Result<ManagerOutcome, ProtocolError> {
        loop {
            self.drain_verdicts(&cache);
            if self.all_exited() && self.violation.is_none() {
                break;
            }
            match feedback.recv_timeout(poll) {
                Ok(msg) => self.on_message(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if !self.all_exited() {
                        self.violate(ProtocolError::ChannelClosed {
                            exited: self.exited_count(),
                            expected: self.worker_count,
                        });
                    }
                    break;
                }
            }
        }

        while let Ok(msg) = feedback.try_recv() {
            self.on_message(msg);
        }
        self.drain_verdicts(&cache);
        self.state = ManagerState::Terminated;

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        match self.violation {
            Some(err) => Err(err),
            None => Ok(self.outcome),
        }
    }
}
