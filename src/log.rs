//! Log aggregation for the build pool.
//!
//! Every worker, the manager and the controller log through a cloneable
//! [`Logger`]. Records travel over one bounded channel to a single aggregator
//! thread, which renders them in arrival order through per-channel formatters
//! and hands the result to each sink.
//!
//! The aggregator only filters by level. Whether a message is worth sending at
//! all (verbosity policy) is decided by the producer's `Logger`.

use crate::config::LogLevel;
use anyhow::{Context, Result};
use colored::*;
use indicatif::ProgressBar;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Which formatter renders a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Info,
    Verbose,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub channel: Channel,
    pub source: Arc<str>,
    pub message: String,
}

/// Destination for rendered records.
pub trait LogSink: Send {
    fn emit(&mut self, record: &LogRecord);
    fn flush(&mut self) {}
}

/// Colored terminal output. Prints above the progress bar when one is active.
pub struct ConsoleSink {
    progress: Option<ProgressBar>,
}

impl ConsoleSink {
    pub fn new(progress: Option<ProgressBar>) -> Self {
        Self { progress }
    }
}

impl LogSink for ConsoleSink {
    fn emit(&mut self, record: &LogRecord) {
        let line = format_colored(record);
        let to_stderr = record.channel == Channel::Error;
        let print = || {
            if to_stderr {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
        };
        match &self.progress {
            Some(pb) if !pb.is_hidden() => pb.suspend(print),
            _ => print(),
        }
    }
}

/// Plain-text log file.
pub struct FileSink {
    out: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn emit(&mut self, record: &LogRecord) {
        // A failing log file must not take the build down with it.
        let _ = writeln!(self.out, "{}", format_plain(record));
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

/// Collects plain-text lines in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn emit(&mut self, record: &LogRecord) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format_plain(record));
        }
    }
}

fn level_tag(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Verbose => "debug",
    }
}

/// `[level] [source] message`, no color.
pub fn format_plain(record: &LogRecord) -> String {
    if record.source.is_empty() {
        format!("[{}] {}", level_tag(record.level), record.message)
    } else {
        format!(
            "[{}] [{}] {}",
            level_tag(record.level),
            record.source,
            record.message
        )
    }
}

pub fn format_colored(record: &LogRecord) -> String {
    let source = if record.source.is_empty() {
        String::new()
    } else {
        format!("{} ", format!("[{}]", record.source).dimmed())
    };
    match record.channel {
        Channel::Info => format!("   {} {}{}", "→".cyan(), source, record.message),
        Channel::Verbose => format!("     {}{}", source, record.message.dimmed()),
        Channel::Error => match record.level {
            LogLevel::Warn => format!("{} {}{}", "!".yellow(), source, record.message.yellow()),
            _ => format!("{} {}{}", "x".red(), source, record.message.red()),
        },
    }
}

/// Producer handle. Cheap to clone; one per worker is typical.
#[derive(Clone)]
pub struct Logger {
    tx: SyncSender<LogRecord>,
    source: Arc<str>,
    max_level: LogLevel,
}

impl Logger {
    /// A logger whose records go nowhere.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::sync_channel(1);
        Self {
            tx,
            source: Arc::from(""),
            max_level: LogLevel::Error,
        }
    }

    /// Same channel, different source label.
    pub fn named(&self, source: impl AsRef<str>) -> Self {
        Self {
            tx: self.tx.clone(),
            source: Arc::from(source.as_ref()),
            max_level: self.max_level,
        }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.max_level
    }

    /// Blocks while the channel is full. Losing log lines is worse than a
    /// short stall; a gone aggregator is ignored.
    pub fn log(&self, level: LogLevel, channel: Channel, message: impl Into<String>) {
        if !self.enabled(level) {
            return;
        }
        let _ = self.tx.send(LogRecord {
            level,
            channel,
            source: Arc::clone(&self.source),
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, Channel::Info, message);
    }

    pub fn verbose(&self, message: impl Into<String>) {
        self.log(LogLevel::Verbose, Channel::Verbose, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, Channel::Error, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, Channel::Error, message);
    }
}

/// The single consumer thread.
pub struct LogAggregator {
    handle: JoinHandle<usize>,
}

impl LogAggregator {
    /// Start the aggregator. Returns the root logger and the join handle.
    pub fn spawn(
        level: LogLevel,
        sinks: Vec<Box<dyn LogSink>>,
        capacity: usize,
    ) -> (Logger, LogAggregator) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let handle = std::thread::spawn(move || consume(rx, level, sinks));
        let logger = Logger {
            tx,
            source: Arc::from(""),
            max_level: level,
        };
        (logger, LogAggregator { handle })
    }

    /// Drop the root logger and wait until every other clone is gone and the
    /// channel is drained. Returns the number of records rendered.
    pub fn finish(self, root: Logger) -> usize {
        drop(root);
        self.handle.join().unwrap_or(0)
    }
}

fn consume(rx: Receiver<LogRecord>, level: LogLevel, mut sinks: Vec<Box<dyn LogSink>>) -> usize {
    let mut rendered = 0;
    for record in rx {
        if record.level > level {
            continue;
        }
        for sink in sinks.iter_mut() {
            sink.emit(&record);
        }
        rendered += 1;
    }
    for sink in sinks.iter_mut() {
        sink.flush();
    }
    rendered
}
