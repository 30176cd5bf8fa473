//! Target builders: the collaborators that actually generate and compile.
//!
//! The worker only observes success or failure. [`CommandBuilder`] is the
//! config-driven implementation used by the CLI: built-in `@KEY@` template
//! expansion, an optional generator command or rhai script, and an optional
//! per-source compiler command.

use super::utils::{expand, run_script, shell_quote};
use crate::config::{CompilerConfig, DepFormat, FwConfig, GeneratorConfig};
use crate::deps::{RawTrace, parse_show_includes, read_make_deps};
use crate::target::{BuildConfig, BuildTarget};
use anyhow::{Context, Result};
use colored::*;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const COMPILABLE: &[&str] = &["c", "cc", "cpp", "cxx", "s", "S", "asm"];

/// What a generation step produced.
#[derive(Debug, Default, Clone)]
pub struct GeneratedFileSet {
    pub files: Vec<PathBuf>,
    /// Include traces the generator reported, if any.
    pub traces: Vec<RawTrace>,
}

pub trait TargetBuilder: Send + Sync {
    /// Produce generated sources for `target` under `out_dir`.
    fn generate(
        &self,
        target: &BuildTarget,
        config: &BuildConfig,
        out_dir: &Path,
    ) -> Result<GeneratedFileSet>;

    /// The expensive phase gated by the post-generation cache. Returns the
    /// include traces the compiler reported.
    fn compile(
        &self,
        _target: &BuildTarget,
        _config: &BuildConfig,
        _generated: &GeneratedFileSet,
        _out_dir: &Path,
    ) -> Result<Vec<RawTrace>> {
        Ok(Vec::new())
    }
}

pub struct CommandBuilder {
    project_dir: PathBuf,
    generator: Option<GeneratorConfig>,
    compiler: Option<CompilerConfig>,
}

impl CommandBuilder {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        generator: Option<GeneratorConfig>,
        compiler: Option<CompilerConfig>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            generator,
            compiler,
        }
    }

    pub fn from_config(project_dir: &Path, config: &FwConfig) -> Self {
        Self::new(project_dir, config.generator.clone(), config.compiler.clone())
    }

    fn target_vars(
        &self,
        target: &BuildTarget,
        config: &BuildConfig,
        out_dir: &Path,
    ) -> Vec<(&'static str, String)> {
        let sources = target
            .sources()
            .unwrap_or_default()
            .iter()
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            ("module", target.id.module.clone()),
            ("arch", target.id.arch.clone()),
            ("name", target.name.clone()),
            ("profile", config.profile.clone()),
            ("module_dir", target.module_dir().to_string_lossy().to_string()),
            ("out_dir", out_dir.to_string_lossy().to_string()),
            ("sources", sources),
            ("flags", config.flags.join(" ")),
        ]
    }

    fn template_suffixes(&self) -> &[String] {
        self.generator
            .as_ref()
            .map(|g| g.template_suffixes.as_slice())
            .unwrap_or_default()
    }
}

/// Replace `@KEY@` with the matching define.
pub fn expand_template(text: &str, config: &BuildConfig) -> String {
    let mut out = text.to_string();
    for (key, value) in &config.defines {
        out = out.replace(&format!("@{}@", key), value);
    }
    out
}

fn is_compilable(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| COMPILABLE.contains(&e.to_string_lossy().as_ref()))
}

impl TargetBuilder for CommandBuilder {
    fn generate(
        &self,
        target: &BuildTarget,
        config: &BuildConfig,
        out_dir: &Path,
    ) -> Result<GeneratedFileSet> {
        let gen_dir = out_dir.join("gen");
        if gen_dir.exists() {
            fs::remove_dir_all(&gen_dir)
                .with_context(|| format!("Failed to clear {}", gen_dir.display()))?;
        }
        fs::create_dir_all(&gen_dir)
            .with_context(|| format!("Failed to create {}", gen_dir.display()))?;

        // 1. Templates
        for source in target.sources().unwrap_or_default() {
            let Some(name) = source.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let Some(stem) = self
                .template_suffixes()
                .iter()
                .find_map(|s| name.strip_suffix(s.as_str()).filter(|stem| !stem.is_empty()))
            else {
                continue;
            };
            let text = fs::read_to_string(source)
                .with_context(|| format!("Failed to read template {}", source.display()))?;
            fs::write(gen_dir.join(stem), expand_template(&text, config))
                .with_context(|| format!("Failed to write generated {}", stem))?;
        }

        // 2. Generator command or script
        if let Some(generator) = &self.generator {
            let vars = self.target_vars(target, config, &gen_dir);
            run_script(&generator.command, &self.project_dir, &vars)
                .with_context(|| format!("Generator failed for {}", target.id))?;
        }

        // 3. Collect outputs; `.d` files are traces, not outputs
        let mut set = GeneratedFileSet::default();
        let mut entries: Vec<PathBuf> = WalkDir::new(&gen_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        entries.sort();
        for path in entries {
            if path.extension().is_some_and(|e| e == "d") {
                set.traces.extend(read_make_deps(&path)?);
            } else {
                set.files.push(path);
            }
        }
        Ok(set)
    }

    fn compile(
        &self,
        target: &BuildTarget,
        config: &BuildConfig,
        generated: &GeneratedFileSet,
        out_dir: &Path,
    ) -> Result<Vec<RawTrace>> {
        let Some(compiler) = &self.compiler else {
            return Ok(Vec::new());
        };
        let obj_dir = out_dir.join("obj");
        fs::create_dir_all(&obj_dir)
            .with_context(|| format!("Failed to create {}", obj_dir.display()))?;

        let units: Vec<&PathBuf> = target
            .sources()
            .unwrap_or_default()
            .iter()
            .chain(&generated.files)
            .filter(|p| is_compilable(p))
            .collect();
        let base = self.target_vars(target, config, out_dir);

        let traces: Vec<Vec<RawTrace>> = units
            .par_iter()
            .enumerate()
            .map(|(i, source)| -> Result<Vec<RawTrace>> {
                let stem = source
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| format!("unit{}", i));
                // Index prefix keeps same-named sources in different dirs apart.
                let object = obj_dir.join(format!("{:03}_{}.o", i, stem));
                let depfile = object.with_extension("d");

                let mut vars = base.clone();
                vars.push(("source", shell_quote(source)));
                vars.push(("object", shell_quote(&object)));
                vars.push(("depfile", shell_quote(&depfile)));
                let command = expand(&compiler.command, &vars);

                let output = run_script(&command, &self.project_dir, &vars)
                    .with_context(|| format!("Error compiling {}", source.display()))?;

                match compiler.dep_format {
                    DepFormat::Make if depfile.exists() => read_make_deps(&depfile),
                    DepFormat::Make => Ok(Vec::new()),
                    DepFormat::Msvc => {
                        let (trace, _rest) = parse_show_includes(&output.stdout, source);
                        Ok(vec![trace])
                    }
                }
            })
            .collect::<Result<_>>()?;

        Ok(traces.into_iter().flatten().collect())
    }
}

/// Turn common toolchain failures into a short hint.
pub fn diagnose(output: &str) -> Option<String> {
    // 1. Memory region overflow (Linker Error)
    if output.contains("will not fit in region") || output.contains("overflowed by") {
        return Some(format!(
            "The image does not fit a {}.\nCheck the linker script or trim the module's {}.",
            "memory region".bold().red(),
            "flags".bold().yellow()
        ));
    }

    // 2. Undefined symbol (Linker Error)
    if output.contains("undefined reference to") || output.contains("LNK2019") {
        return Some(format!(
            "It looks like a {} error.\nA module this target needs may be missing from {}.",
            "Linker".bold().red(),
            "fwbuild.toml".bold().yellow()
        ));
    }

    // 3. Missing header (Compiler Error)
    if (output.contains("fatal error: ") && output.contains("No such file or directory"))
        || output.contains("cannot open include file")
    {
        return Some(format!(
            "It looks like a {} error.\nIf the header is generated, check the generator's {}.",
            "Missing Header".bold().red(),
            "template_suffixes".bold().yellow()
        ));
    }

    None
}
