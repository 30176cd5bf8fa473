use super::core::{BuildOptions, build_project, root_settings};
use crate::config::{BuildSettings, FwConfig};
use anyhow::Result;
use colored::*;
use notify::{Config, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

/// Paths the build itself writes. Events touching only these never trigger a
/// rebuild.
pub(crate) struct BuildOutputs {
    output_dir: PathBuf,
    cache_dir: PathBuf,
    log_file: Option<PathBuf>,
}

impl BuildOutputs {
    pub(crate) fn new(settings: &BuildSettings, project_dir: &Path) -> Self {
        let rooted = root_settings(settings.clone(), project_dir);
        Self {
            output_dir: rooted.output_dir,
            cache_dir: rooted.cache_dir,
            log_file: rooted.log_file,
        }
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.output_dir)
            || path.starts_with(&self.cache_dir)
            || self.log_file.as_deref() == Some(path)
    }
}

/// Rebuild on every change under the source root. Changes to build outputs,
/// the fingerprint cache, or the log file are ignored so a build never
/// triggers itself.
pub fn watch(
    project_dir: &Path,
    config: &FwConfig,
    settings: BuildSettings,
    options: &BuildOptions,
) -> Result<()> {
    let source_root = match &config.project.source_root {
        Some(r) => project_dir.join(r),
        None => project_dir.to_path_buf(),
    };
    // Events carry absolute paths.
    let root = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    let outputs = BuildOutputs::new(&settings, &root);
    println!(
        "{} Watching for changes in {}...",
        "👀".cyan(),
        source_root.display()
    );

    let (tx, rx) = channel();
    let config_notify = Config::default().with_poll_interval(Duration::from_secs(1));
    let mut watcher = notify::RecommendedWatcher::new(tx, config_notify)?;
    watcher.watch(&source_root, RecursiveMode::Recursive)?;

    // First run
    rebuild(project_dir, config, &settings, options);

    while let Ok(event) = rx.recv() {
        let relevant = match &event {
            Ok(ev) => ev.paths.iter().any(|p| !outputs.contains(p)),
            Err(_) => false,
        };
        if !relevant {
            continue;
        }
        // Debounce simple
        std::thread::sleep(Duration::from_millis(100));
        while rx.try_recv().is_ok() {}
        rebuild(project_dir, config, &settings, options);
    }
    Ok(())
}

fn rebuild(
    project_dir: &Path,
    config: &FwConfig,
    settings: &BuildSettings,
    options: &BuildOptions,
) {
    print!("\x1B[2J\x1B[1;1H");
    println!("{} File changed. Rebuilding...", "🔄".yellow());

    match build_project(project_dir, config, settings.clone(), options) {
        Ok(report) => report.print(),
        Err(e) => println!("{} Error: {:#}", "x".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_outputs_cover_cache_and_log() {
        let settings = BuildSettings {
            output_dir: PathBuf::from("out"),
            cache_dir: PathBuf::from(".fwcache"),
            log_file: Some(PathBuf::from("fwb.log")),
            ..Default::default()
        };
        let outputs = BuildOutputs::new(&settings, Path::new("/fw"));

        assert!(outputs.contains(Path::new("/fw/out/uart/gen/board.h")));
        assert!(outputs.contains(Path::new("/fw/.fwcache/uart@cortex-m4.json")));
        assert!(outputs.contains(Path::new("/fw/fwb.log")));
        assert!(!outputs.contains(Path::new("/fw/uart/main.c")));
        assert!(!outputs.contains(Path::new("/fw/fwb.log.bak")));
    }

    #[test]
    fn test_absolute_dirs_are_kept() {
        let settings = BuildSettings {
            output_dir: PathBuf::from("/tmp/fw-out"),
            cache_dir: PathBuf::from("/tmp/fw-cache"),
            ..Default::default()
        };
        let outputs = BuildOutputs::new(&settings, Path::new("/fw"));

        assert!(outputs.contains(Path::new("/tmp/fw-cache/a.json")));
        assert!(!outputs.contains(Path::new("/fw/tmp/fw-cache/a.json")));
    }
}
