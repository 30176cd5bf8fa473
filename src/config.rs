use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Parsed `fwbuild.toml`.
#[derive(Deserialize, Debug, Default)]
pub struct FwConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub build: SettingsConfig,
    pub generator: Option<GeneratorConfig>,
    pub compiler: Option<CompilerConfig>,
    /// Explicit derivation pairs: generated path -> path it was produced from.
    #[serde(default)]
    pub intermediates: BTreeMap<PathBuf, PathBuf>,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Root all module paths are relative to. Defaults to the config directory.
    pub source_root: Option<PathBuf>,
    #[serde(default)]
    pub defines: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// The `[build]` table. Every field is optional so env vars and CLI flags can
/// fill the gaps.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct SettingsConfig {
    pub jobs: Option<usize>,
    pub pre_gen_cache: Option<bool>,
    pub post_gen_cache: Option<bool>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub queue_capacity: Option<usize>,
    pub queue_end: Option<QueueEnd>,
    pub poll_interval_ms: Option<u64>,
    pub starvation_limit: Option<u32>,
    pub channel_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GeneratorConfig {
    /// Shell command, or a path ending in `.rhai`.
    pub command: String,
    /// Suffixes stripped from a source to name its generated counterpart,
    /// e.g. `.in` for `config.h.in -> config.h`.
    #[serde(default)]
    pub template_suffixes: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CompilerConfig {
    pub command: String,
    #[serde(default)]
    pub dep_format: DepFormat,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DepFormat {
    /// Makefile-style sidecar `.d` files.
    #[default]
    Make,
    /// Inline `/showIncludes` notes on the compiler's stdout.
    Msvc,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TargetConfig {
    pub module: String,
    pub arch: String,
    pub name: Option<String>,
    #[serde(default)]
    pub library: bool,
    pub sources: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub metadata: Vec<PathBuf>,
    #[serde(default)]
    pub defines: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// How the controller tells workers that population is finished.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueEnd {
    /// Push one `NoMoreWork` marker per worker.
    #[default]
    Sentinel,
    /// Close the queue; a drained, closed queue reads as `Closed`.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Verbose,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "quiet" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" | "default" => Some(Self::Info),
            "verbose" | "debug" => Some(Self::Verbose),
            _ => None,
        }
    }
}

/// Resolved run settings, after config file, environment and CLI are merged.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub jobs: usize,
    pub pre_gen_cache: bool,
    pub post_gen_cache: bool,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub queue_capacity: usize,
    pub queue_end: QueueEnd,
    pub poll_interval: Duration,
    pub starvation_limit: u32,
    pub channel_capacity: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pre_gen_cache: true,
            post_gen_cache: true,
            log_level: LogLevel::Info,
            log_file: None,
            cache_dir: PathBuf::from("build").join(".fwcache"),
            output_dir: PathBuf::from("build"),
            queue_capacity: 64,
            queue_end: QueueEnd::Sentinel,
            poll_interval: Duration::from_millis(20),
            starvation_limit: 250,
            channel_capacity: 256,
        }
    }
}

impl BuildSettings {
    /// Layer a `[build]` table over the defaults.
    pub fn from_config(cfg: &SettingsConfig) -> Self {
        let mut s = Self::default();
        if let Some(jobs) = cfg.jobs {
            s.jobs = jobs;
        }
        if let Some(v) = cfg.pre_gen_cache {
            s.pre_gen_cache = v;
        }
        if let Some(v) = cfg.post_gen_cache {
            s.post_gen_cache = v;
        }
        if let Some(level) = cfg.log_level.as_deref().and_then(LogLevel::parse) {
            s.log_level = level;
        }
        if let Some(dir) = &cfg.cache_dir {
            s.cache_dir = dir.clone();
        }
        if let Some(dir) = &cfg.output_dir {
            s.output_dir = dir.clone();
        }
        if let Some(cap) = cfg.queue_capacity {
            s.queue_capacity = cap;
        }
        if let Some(end) = cfg.queue_end {
            s.queue_end = end;
        }
        if let Some(ms) = cfg.poll_interval_ms {
            s.poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = cfg.starvation_limit {
            s.starvation_limit = limit;
        }
        if let Some(cap) = cfg.channel_capacity {
            s.channel_capacity = cap;
        }
        s.log_file = cfg.log_file.clone();
        s
    }

    /// Apply `FWB_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(jobs) = var("FWB_JOBS").and_then(|v| v.parse().ok()) {
            self.jobs = jobs;
        }
        if let Some(level) = var("FWB_LOG").as_deref().and_then(LogLevel::parse) {
            self.log_level = level;
        }
        if let Some(v) = var("FWB_PREGEN_CACHE").as_deref().and_then(parse_bool) {
            self.pre_gen_cache = v;
        }
        if let Some(v) = var("FWB_POSTGEN_CACHE").as_deref().and_then(parse_bool) {
            self.post_gen_cache = v;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jobs == 0 {
            return Err("jobs must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_profile() -> String {
    "debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[project]
name = "sensor-fw"
defines = { BOARD = "nucleo" }

[build]
jobs = 3
post_gen_cache = false
queue_end = "close"

[generator]
command = "python3 tools/gen.py {module} {arch} {out_dir}"
template_suffixes = [".in"]

[compiler]
command = "arm-none-eabi-gcc -c {sources} -MMD"
dep_format = "make"

[intermediates]
"build/gen/startup.s" = "hal/startup.S"

[[target]]
module = "drivers/uart"
arch = "cortex-m4"
library = true
metadata = ["drivers/uart/module.toml"]

[[target]]
module = "app"
arch = "cortex-m4"
sources = ["app/main.c"]
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg: FwConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.project.name, "sensor-fw");
        assert_eq!(cfg.project.profile, "debug");
        assert_eq!(cfg.targets.len(), 2);
        assert!(cfg.targets[0].library);
        assert_eq!(cfg.targets[1].sources.as_ref().unwrap().len(), 1);
        assert_eq!(cfg.compiler.unwrap().dep_format, DepFormat::Make);
        assert_eq!(cfg.intermediates.len(), 1);

        let s = BuildSettings::from_config(&cfg.build);
        assert_eq!(s.jobs, 3);
        assert!(s.pre_gen_cache);
        assert!(!s.post_gen_cache);
        assert_eq!(s.queue_end, QueueEnd::Close);
    }

    #[test]
    fn test_env_overrides() {
        let mut s = BuildSettings::default();
        s.apply_env(|k| match k {
            "FWB_JOBS" => Some("7".into()),
            "FWB_LOG" => Some("verbose".into()),
            "FWB_PREGEN_CACHE" => Some("off".into()),
            "FWB_POSTGEN_CACHE" => Some("maybe".into()),
            _ => None,
        });
        assert_eq!(s.jobs, 7);
        assert_eq!(s.log_level, LogLevel::Verbose);
        assert!(!s.pre_gen_cache);
        assert!(s.post_gen_cache);
    }

    #[test]
    fn test_validate_rejects_zero_jobs() {
        let s = BuildSettings {
            jobs: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
        assert!(BuildSettings::default().validate().is_ok());
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Verbose);
        assert_eq!(LogLevel::parse("QUIET"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("nope"), None);
    }
}
