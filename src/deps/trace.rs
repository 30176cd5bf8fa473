//! Parsers for compiler include traces.
//!
//! Two shapes show up in practice:
//!
//! - Makefile-style sidecar files (`gcc -MMD`, `clang -MD`, `armcc --depend`):
//!   `obj.o: src.c a.h b.h` with backslash-newline continuations. Some
//!   toolchains write one prerequisite per rule, repeated for the same target.
//! - Inline MSVC `/showIncludes` notes on stdout, where the indentation after
//!   the colon gives the nesting depth.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// One compiler invocation's view of what a source pulled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTrace {
    /// The rule target (usually the object file), when the format names one.
    pub rule_target: Option<PathBuf>,
    pub source: PathBuf,
    /// `(includer, included)` pairs. Flat formats use `source` as includer.
    pub edges: Vec<(PathBuf, PathBuf)>,
}

impl RawTrace {
    pub fn includes(&self) -> impl Iterator<Item = &PathBuf> {
        self.edges.iter().map(|(_, included)| included)
    }
}

/// Drop `.` components so `./a.h` and `a.h` compare equal.
pub fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Read and parse a `.d` file.
pub fn read_make_deps(path: &Path) -> Result<Vec<RawTrace>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dependency file {}", path.display()))?;
    Ok(parse_make_deps(&content))
}

/// Parse Makefile-style dependency rules.
///
/// Rules without prerequisites (the phony `header.h:` lines `-MP` adds) are
/// skipped. Repeated rules for one target are merged in order.
pub fn parse_make_deps(content: &str) -> Vec<RawTrace> {
    let joined = content.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut order: Vec<PathBuf> = Vec::new();
    let mut prereqs: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();

    for line in joined.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(split) = find_rule_colon(line) else {
            continue;
        };
        let Some(target) = split_dep_tokens(&line[..split]).into_iter().next() else {
            continue;
        };
        let target = normalize(Path::new(&target));
        let deps: Vec<PathBuf> = split_dep_tokens(&line[split + 1..])
            .into_iter()
            .map(|t| normalize(Path::new(&t)))
            .collect();
        if deps.is_empty() {
            continue;
        }
        prereqs
            .entry(target.clone())
            .or_insert_with(|| {
                order.push(target);
                Vec::new()
            })
            .extend(deps);
    }

    order
        .into_iter()
        .filter_map(|target| {
            let deps = prereqs.remove(&target)?;
            let mut iter = deps.into_iter();
            let source = iter.next()?;
            let edges = iter.map(|d| (source.clone(), d)).collect();
            Some(RawTrace {
                rule_target: Some(target),
                source,
                edges,
            })
        })
        .collect()
}

/// The rule separator is the first `:` followed by whitespace or end of line,
/// so drive letters (`C:/obj/x.o: ...`) survive.
fn find_rule_colon(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    (0..bytes.len()).find(|&i| {
        bytes[i] == b':' && bytes.get(i + 1).is_none_or(|b| b.is_ascii_whitespace())
    })
}

/// Split on whitespace, honoring `\ ` escapes and make's `$$`.
fn split_dep_tokens(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&' ') => {
                current.push(' ');
                chars.next();
            }
            '$' if chars.peek() == Some(&'$') => {
                current.push('$');
                chars.next();
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn show_includes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Note: including file:( +)(\S.*?)\s*$").expect("static regex is valid")
    })
}

/// Parse `/showIncludes` notes for one translation unit.
///
/// Returns the trace and the compiler output with the notes removed.
pub fn parse_show_includes(output: &str, source: &Path) -> (RawTrace, String) {
    let re = show_includes_re();
    let source = normalize(source);
    let mut stack: Vec<PathBuf> = vec![source.clone()];
    let mut edges = Vec::new();
    let mut rest = String::new();

    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            rest.push_str(line);
            rest.push('\n');
            continue;
        };
        let depth = caps[1].len().max(1);
        let included = normalize(Path::new(&caps[2]));
        // A jump deeper than one level means notes were lost; attach to the
        // deepest known includer.
        stack.truncate(depth.min(stack.len()));
        let includer = stack.last().cloned().unwrap_or_else(|| source.clone());
        edges.push((includer, included.clone()));
        stack.push(included);
    }

    (
        RawTrace {
            rule_target: None,
            source,
            edges,
        },
        rest,
    )
}

/// Escape a path for a make rule.
pub fn escape_make_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('$', "$$")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gcc_style() {
        let d = concat!(
            "build/obj/uart.o: drivers/uart/uart.c \\\n",
            "  drivers/uart/uart.h \\\n",
            "  hal/regs.h\n\n",
            "drivers/uart/uart.h:\nhal/regs.h:\n",
        );
        let traces = parse_make_deps(d);
        assert_eq!(traces.len(), 1);
        let t = &traces[0];
        assert_eq!(t.rule_target, Some(PathBuf::from("build/obj/uart.o")));
        assert_eq!(t.source, PathBuf::from("drivers/uart/uart.c"));
        let inc: Vec<_> = t.includes().cloned().collect();
        assert_eq!(
            inc,
            vec![PathBuf::from("drivers/uart/uart.h"), PathBuf::from("hal/regs.h")]
        );
    }

    #[test]
    fn test_parse_one_prereq_per_line() {
        let d = "main.o: ./app/main.c\nmain.o: app/config.h\nmain.o: lib/ring.h\n";
        let traces = parse_make_deps(d);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].source, PathBuf::from("app/main.c"));
        assert_eq!(traces[0].edges.len(), 2);
    }

    #[test]
    fn test_escaped_spaces_and_dollars() {
        let d = "out.o: my\\ src/a.c inc/$$ver.h\n";
        let traces = parse_make_deps(d);
        assert_eq!(traces[0].source, PathBuf::from("my src/a.c"));
        assert_eq!(traces[0].edges[0].1, PathBuf::from("inc/$ver.h"));
    }

    #[test]
    fn test_escaped_space_in_rule_target() {
        let d = "obj/a\\ b.o: src/a\\ b.c inc/a.h\n";
        let traces = parse_make_deps(d);
        assert_eq!(traces[0].rule_target, Some(PathBuf::from("obj/a b.o")));
        assert_eq!(traces[0].source, PathBuf::from("src/a b.c"));
    }

    #[test]
    fn test_windows_drive_letters() {
        let d = "C:/fw/obj/a.o: C:/fw/src/a.c C:/fw/inc/a.h\r\n";
        let traces = parse_make_deps(d);
        assert_eq!(traces[0].rule_target, Some(PathBuf::from("C:/fw/obj/a.o")));
        assert_eq!(traces[0].source, PathBuf::from("C:/fw/src/a.c"));
    }

    #[test]
    fn test_show_includes_nesting() {
        let out = concat!(
            "a.c\n",
            "Note: including file: inc/a.h\n",
            "Note: including file:  inc/b.h\n",
            "Note: including file: inc/c.h\n",
            "warning C4100: unused\n",
        );
        let (trace, rest) = parse_show_includes(out, Path::new("src/a.c"));
        assert_eq!(
            trace.edges,
            vec![
                (PathBuf::from("src/a.c"), PathBuf::from("inc/a.h")),
                (PathBuf::from("inc/a.h"), PathBuf::from("inc/b.h")),
                (PathBuf::from("src/a.c"), PathBuf::from("inc/c.h")),
            ]
        );
        assert_eq!(rest, "a.c\nwarning C4100: unused\n");
    }

    #[test]
    fn test_escape_make_path() {
        assert_eq!(escape_make_path(Path::new("a b/$x.h")), "a\\ b/$$x.h");
    }
}
