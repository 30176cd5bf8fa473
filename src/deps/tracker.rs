//! Consolidation of include traces into per-source dependency records.
//!
//! Generated intermediates (template output, preprocessed sources) are folded
//! back onto the source they came from, so a regenerated file with unchanged
//! inputs never shows up as a dependency of its own origin.

use super::trace::{RawTrace, escape_make_path, normalize};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Derivation table for generated files.
///
/// Built once per run before workers start, then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct IntermediateMap {
    derived_from: HashMap<PathBuf, PathBuf>,
    consumed_by: HashMap<PathBuf, PathBuf>,
}

impl IntermediateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `output` is produced from `input`.
    pub fn insert(&mut self, output: impl AsRef<Path>, input: impl AsRef<Path>) {
        let output = normalize(output.as_ref());
        let input = normalize(input.as_ref());
        if output == input {
            return;
        }
        self.consumed_by.insert(input.clone(), output.clone());
        self.derived_from.insert(output, input);
    }

    /// Map every source carrying one of `suffixes` to its generated
    /// counterpart in `out_dir` (`config.h.in` -> `out_dir/config.h`).
    pub fn add_template_rule(&mut self, sources: &[PathBuf], suffixes: &[String], out_dir: &Path) {
        for source in sources {
            let Some(file_name) = source.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            for suffix in suffixes {
                if let Some(stem) = file_name.strip_suffix(suffix.as_str())
                    && !stem.is_empty()
                {
                    self.insert(out_dir.join(stem), source);
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.derived_from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.derived_from.is_empty()
    }

    pub fn is_intermediate(&self, path: &Path) -> bool {
        self.derived_from.contains_key(&normalize(path))
    }

    /// Follow derivations back to the original file.
    pub fn origin(&self, path: &Path) -> PathBuf {
        follow(&self.derived_from, normalize(path))
    }

    /// Follow derivations forward to the last product in the chain.
    pub fn final_output(&self, path: &Path) -> PathBuf {
        follow(&self.consumed_by, normalize(path))
    }
}

fn follow(edges: &HashMap<PathBuf, PathBuf>, start: PathBuf) -> PathBuf {
    let mut seen = HashSet::new();
    let mut current = start;
    while let Some(next) = edges.get(&current) {
        if !seen.insert(current.clone()) {
            break;
        }
        current = next.clone();
    }
    current
}

/// Consolidated dependencies of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub source: PathBuf,
    /// Ordered, duplicate-free, intermediates folded onto their origin.
    pub includes: Vec<PathBuf>,
    /// The final artifact this source ends up in, when the trace named one.
    pub resolved_target: Option<PathBuf>,
}

pub struct DependencyTracker<'a> {
    map: &'a IntermediateMap,
}

impl<'a> DependencyTracker<'a> {
    pub fn new(map: &'a IntermediateMap) -> Self {
        Self { map }
    }

    /// Turn raw traces into one record per original source.
    ///
    /// Nested traces are followed transitively, so a header pulled in by a
    /// header is a dependency of the source too.
    pub fn consolidate(&self, traces: &[RawTrace]) -> Vec<DependencyRecord> {
        let mut graph: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        let mut sources: Vec<PathBuf> = Vec::new();
        let mut targets: HashMap<PathBuf, PathBuf> = HashMap::new();

        for trace in traces {
            let source = self.map.origin(&trace.source);
            if !sources.contains(&source) {
                sources.push(source.clone());
            }
            if let Some(rule_target) = &trace.rule_target {
                targets
                    .entry(source.clone())
                    .or_insert_with(|| self.map.final_output(rule_target));
            }
            for (from, to) in &trace.edges {
                let from = self.map.origin(from);
                let to = self.map.origin(to);
                if from == to {
                    continue;
                }
                let out = graph.entry(from).or_default();
                if !out.contains(&to) {
                    out.push(to);
                }
            }
        }

        sources
            .into_iter()
            .map(|source| {
                let includes = closure(&graph, &source);
                DependencyRecord {
                    resolved_target: targets.remove(&source),
                    source,
                    includes,
                }
            })
            .collect()
    }

    /// Replace records for re-traced sources, keep the rest.
    pub fn merge(
        &self,
        previous: Vec<DependencyRecord>,
        fresh: Vec<DependencyRecord>,
    ) -> Vec<DependencyRecord> {
        let fresh_sources: HashSet<&PathBuf> = fresh.iter().map(|r| &r.source).collect();
        let mut merged: Vec<DependencyRecord> = previous
            .into_iter()
            .filter(|r| !fresh_sources.contains(&r.source))
            .collect();
        merged.extend(fresh);
        merged
    }
}

/// Depth-first walk in first-seen order. Never yields `root` itself.
fn closure(graph: &HashMap<PathBuf, Vec<PathBuf>>, root: &Path) -> Vec<PathBuf> {
    let mut seen: HashSet<&Path> = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<&Path> = vec![root];
    seen.insert(root);

    while let Some(node) = stack.pop() {
        if node != root {
            out.push(node.to_path_buf());
        }
        if let Some(children) = graph.get(node) {
            for child in children.iter().rev() {
                if seen.insert(child.as_path()) {
                    stack.push(child);
                }
            }
        }
    }
    out
}

/// Drop history for sources that are no longer part of the target. A renamed
/// or moved source starts over with no history. Generated units count as part
/// of the target while the generator still produces them.
pub fn retain_current(
    records: Vec<DependencyRecord>,
    sources: &[PathBuf],
    generated: &[PathBuf],
) -> Vec<DependencyRecord> {
    let current: HashSet<PathBuf> = sources
        .iter()
        .chain(generated)
        .map(|s| normalize(s))
        .collect();
    records
        .into_iter()
        .filter(|r| current.contains(&r.source))
        .collect()
}

/// Union of all includes, first-seen order, no duplicates.
pub fn flatten(records: &[DependencyRecord]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|r| r.includes.iter())
        .filter(|p| seen.insert(p.as_path()))
        .cloned()
        .collect()
}

/// `artifact: src1 src2 dep1 dep2`, suitable for an incremental-build rule.
pub fn make_rule(artifact: &Path, records: &[DependencyRecord]) -> String {
    let flat = flatten(records);
    let mut seen: HashSet<&Path> = HashSet::new();
    let prereqs: Vec<String> = records
        .iter()
        .map(|r| r.source.as_path())
        .chain(flat.iter().map(PathBuf::as_path))
        .filter(|p| seen.insert(*p))
        .map(escape_make_path)
        .collect();
    if prereqs.is_empty() {
        format!("{}:", escape_make_path(artifact))
    } else {
        format!("{}: {}", escape_make_path(artifact), prereqs.join(" "))
    }
}
