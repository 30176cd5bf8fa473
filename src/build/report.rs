//! The controller's final report.

use crate::target::TargetId;
use crate::ui;
use colored::*;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CachePhase {
    PreGen,
    PostGen,
}

impl fmt::Display for CachePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePhase::PreGen => write!(f, "pre-gen"),
            CachePhase::PostGen => write!(f, "post-gen"),
        }
    }
}

/// One cache decision, emitted on the cache-status channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheVerdict {
    pub id: TargetId,
    pub phase: CachePhase,
    pub hit: bool,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub succeeded: BTreeSet<TargetId>,
    pub failed: BTreeSet<TargetId>,
    /// Never started. Distinct from `failed`.
    pub not_attempted: BTreeSet<TargetId>,
    pub verdicts: BTreeSet<CacheVerdict>,
    /// Indices of workers that exited abnormally.
    pub crashed_workers: BTreeSet<usize>,
    pub generated: usize,
    pub compiled: usize,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty() && self.crashed_workers.is_empty()
    }

    pub fn verdict(&self, id: &TargetId, phase: CachePhase) -> Option<bool> {
        self.verdicts
            .iter()
            .find(|v| v.id == *id && v.phase == phase)
            .map(|v| v.hit)
    }

    pub fn hits(&self, phase: CachePhase) -> usize {
        self.verdicts
            .iter()
            .filter(|v| v.phase == phase && v.hit)
            .count()
    }

    pub fn misses(&self, phase: CachePhase) -> usize {
        self.verdicts
            .iter()
            .filter(|v| v.phase == phase && !v.hit)
            .count()
    }

    fn status_of(&self, id: &TargetId) -> ColoredString {
        if self.failed.contains(id) {
            "failed".red()
        } else if self.not_attempted.contains(id) {
            "not attempted".yellow()
        } else if self.verdict(id, CachePhase::PreGen) == Some(true) {
            "up to date".dimmed()
        } else {
            "built".green()
        }
    }

    fn cache_cell(&self, id: &TargetId, phase: CachePhase) -> String {
        match self.verdict(id, phase) {
            Some(true) => "hit".green().to_string(),
            Some(false) => "miss".yellow().to_string(),
            None => "-".dimmed().to_string(),
        }
    }

    /// Per-target table followed by a one-line summary.
    pub fn print(&self) {
        let all: BTreeSet<&TargetId> = self
            .succeeded
            .iter()
            .chain(&self.failed)
            .chain(&self.not_attempted)
            .collect();

        if !all.is_empty() {
            let mut table = ui::Table::new(&["Target", "Status", "Pre-gen", "Post-gen"]);
            for id in all {
                table.add_row(vec![
                    id.to_string(),
                    self.status_of(id).to_string(),
                    self.cache_cell(id, CachePhase::PreGen),
                    self.cache_cell(id, CachePhase::PostGen),
                ]);
            }
            table.print();
        }

        for worker in &self.crashed_workers {
            println!("{} Worker {} exited abnormally", "x".red(), worker);
        }

        let summary = format!(
            "{} succeeded, {} failed, {} not attempted ({} generated, {} compiled, {} cached)",
            self.succeeded.len(),
            self.failed.len(),
            self.not_attempted.len(),
            self.generated,
            self.compiled,
            self.hits(CachePhase::PreGen) + self.hits(CachePhase::PostGen),
        );
        if self.success() {
            println!("{} {} in {:.2?}", "✓".green(), summary, self.elapsed);
        } else {
            println!("{} {} in {:.2?}", "x".red(), summary, self.elapsed);
            for id in &self.failed {
                println!("   {} {}", "→".red(), id);
            }
        }
    }
}
