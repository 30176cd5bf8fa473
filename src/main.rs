//! # fwbuild CLI Entry Point
//!
//! This is the main executable for the `fwb` command-line tool.
//! It parses CLI arguments using clap and routes commands to the library.
//!
//! ## Command Structure
//!
//! - **Build**: `build`, `watch`, `clean`
//! - **Inspection**: `deps`, `cache`
//! - **Shell**: `completions`
//!
//! Exit codes: `0` on success, `1` when a target failed or was never
//! attempted, `2` when the tool itself could not run.

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::*;
use std::path::{Path, PathBuf};

use fwbuild::build::{self, BuildOptions};
use fwbuild::cache;
use fwbuild::config::{BuildSettings, FwConfig, LogLevel, QueueEnd};
use fwbuild::deps;
use fwbuild::fingerprint::{DiskStore, FingerprintStore};
use fwbuild::resolve::targets_from_config;
use fwbuild::target::TargetId;

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn SetConsoleOutputCP(wCodePageID: u32) -> i32;
    fn SetConsoleCP(wCodePageID: u32) -> i32;
}

#[cfg(windows)]
fn enable_windows_utf8_console() {
    unsafe {
        SetConsoleOutputCP(65001);
        SetConsoleCP(65001);
    }
}

#[cfg(not(windows))]
fn enable_windows_utf8_console() {}

#[derive(Parser)]
#[command(name = "fwb")]
#[command(about = "Parallel, cache-aware firmware build orchestration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory containing fwbuild.toml
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Log every cache verdict and command
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build targets from fwbuild.toml
    Build {
        #[command(flatten)]
        select: Selection,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Rebuild whenever a source file changes
    Watch {
        #[command(flatten)]
        select: Selection,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Print the recorded dependency rule of one module
    Deps {
        /// Module path as written in fwbuild.toml
        module: String,
        /// Architecture (required when the module is built for several)
        #[arg(long)]
        arch: Option<String>,
    },
    /// Manage the fingerprint cache
    Cache {
        #[command(subcommand)]
        op: CacheOp,
    },
    /// Remove build outputs
    Clean {
        /// Only drop fingerprint records
        #[arg(long)]
        cache: bool,
        /// Modules to clean (default: everything)
        modules: Vec<String>,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(clap::Args, Clone)]
struct Selection {
    /// Only build these modules
    modules: Vec<String>,
    /// Only build targets for this architecture
    #[arg(long)]
    arch: Option<String>,
    /// Build profile (overrides [project].profile)
    #[arg(long)]
    profile: Option<String>,
}

#[derive(clap::Args, Clone)]
struct Tuning {
    /// Number of workers
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Never skip generation on a cache hit
    #[arg(long)]
    no_pregen_cache: bool,
    /// Never skip compilation on a cache hit
    #[arg(long)]
    no_postgen_cache: bool,
    /// How workers learn the queue is finished
    #[arg(long, value_parser = ["sentinel", "close"])]
    queue_end: Option<String>,
}

#[derive(Subcommand)]
enum CacheOp {
    /// Print the cache directory
    Path,
    /// List fingerprint records
    List,
    /// Drop every record
    Clean,
    /// Drop records of targets no longer configured
    Prune,
}

fn main() {
    enable_windows_utf8_console();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "x".red(), e);
            std::process::exit(2);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(0);
    }

    let project_dir = cli.dir.as_path();
    let config = build::load_config(project_dir)?;

    match &cli.command {
        Commands::Build { select, tuning } => {
            let settings = settings(cli, &config, Some(tuning))?;
            let report = build::build_project(project_dir, &config, settings, &options(select))?;
            report.print();
            Ok(if report.success() { 0 } else { 1 })
        }

        Commands::Watch { select, tuning } => {
            let settings = settings(cli, &config, Some(tuning))?;
            build::watch(project_dir, &config, settings, &options(select))?;
            Ok(0)
        }

        Commands::Deps { module, arch } => {
            let settings = build::root_settings(settings(cli, &config, None)?, project_dir);
            print_deps(project_dir, &config, &settings, module, arch.as_deref())?;
            Ok(0)
        }

        Commands::Cache { op } => {
            let settings = build::root_settings(settings(cli, &config, None)?, project_dir);
            match op {
                CacheOp::Path => cache::print_path(&settings)?,
                CacheOp::List => cache::list(&settings)?,
                CacheOp::Clean => cache::clean(&settings)?,
                CacheOp::Prune => {
                    let keep: Vec<TargetId> = targets_from_config(&config, project_dir)?
                        .into_iter()
                        .map(|t| t.id)
                        .collect();
                    cache::prune_unused(&settings, &keep)?;
                }
            }
            Ok(0)
        }

        Commands::Clean { cache, modules } => {
            let settings = build::root_settings(settings(cli, &config, None)?, project_dir);
            let targets: Vec<TargetId> = if modules.is_empty() {
                Vec::new()
            } else {
                let selected: Vec<TargetId> = targets_from_config(&config, project_dir)?
                    .into_iter()
                    .map(|t| t.id)
                    .filter(|id| modules.contains(&id.module))
                    .collect();
                if selected.is_empty() {
                    bail!("No configured target matches {}", modules.join(", "));
                }
                selected
            };
            build::clean(&settings, *cache, &targets)?;
            Ok(0)
        }

        Commands::Completions { .. } => Ok(0),
    }
}

/// Defaults, then `[build]`, then `FWB_*`, then flags.
fn settings(cli: &Cli, config: &FwConfig, tuning: Option<&Tuning>) -> Result<BuildSettings> {
    let mut settings = BuildSettings::from_config(&config.build);
    settings.apply_env(|key| std::env::var(key).ok());

    if cli.verbose {
        settings.log_level = LogLevel::Verbose;
    } else if cli.quiet {
        settings.log_level = LogLevel::Error;
    }

    if let Some(t) = tuning {
        if let Some(jobs) = t.jobs {
            settings.jobs = jobs;
        }
        if t.no_pregen_cache {
            settings.pre_gen_cache = false;
        }
        if t.no_postgen_cache {
            settings.post_gen_cache = false;
        }
        match t.queue_end.as_deref() {
            Some("close") => settings.queue_end = QueueEnd::Close,
            Some("sentinel") => settings.queue_end = QueueEnd::Sentinel,
            _ => {}
        }
    }

    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid settings: {}", e))?;
    Ok(settings)
}

fn options(select: &Selection) -> BuildOptions {
    BuildOptions {
        modules: select.modules.clone(),
        arch: select.arch.clone(),
        profile: select.profile.clone(),
    }
}

fn print_deps(
    project_dir: &Path,
    config: &FwConfig,
    settings: &BuildSettings,
    module: &str,
    arch: Option<&str>,
) -> Result<()> {
    let matches: Vec<_> = targets_from_config(config, project_dir)?
        .into_iter()
        .filter(|t| t.id.module == module && arch.is_none_or(|a| a == t.id.arch))
        .collect();
    let target = match matches.as_slice() {
        [] => bail!("No configured target for module '{}'", module),
        [one] => one,
        _ => bail!(
            "Module '{}' is built for several architectures, pass --arch",
            module
        ),
    };

    let store = DiskStore::new(&settings.cache_dir);
    let record = store
        .load(&target.id)
        .with_context(|| format!("Failed to read the fingerprint of {}", target.id))?;
    let Some(record) = record else {
        println!(
            "{} {} has not been built yet. Run 'fwb build {}' first.",
            "ℹ".blue(),
            target.id,
            module
        );
        return Ok(());
    };

    let artifact = settings.output_dir.join(target.id.slug()).join(&target.name);
    println!("{}", deps::make_rule(&artifact, &record.dependencies));
    Ok(())
}
