//! Cache behavior for targets whose generator emits compiled units
//!
//! Each module has a `main.c` and a `board.h.in` template. Generation expands
//! the template into `gen/board.h` and writes a `gen/vectors.c` unit; the
//! compile step reports traces for both `main.c` and `gen/vectors.c`.

use anyhow::Result;
use fwbuild::build::core::intermediate_map;
use fwbuild::build::{
    BuildContext, BuildReport, CachePhase, GeneratedFileSet, TargetBuilder, root_settings,
    run_build,
};
use fwbuild::config::{BuildSettings, FwConfig};
use fwbuild::deps::RawTrace;
use fwbuild::fingerprint::{DiskStore, FingerprintStore};
use fwbuild::log::Logger;
use fwbuild::resolve::{ManifestResolver, targets_from_config};
use fwbuild::target::{BuildConfig, BuildTarget, TargetId};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const CONFIG: &str = r#"
[project]
name = "gen-fixture"

[generator]
command = "true"
template_suffixes = [".in"]

[[target]]
module = "uart"
arch = "cortex-m4"

[[target]]
module = "spi"
arch = "cortex-m4"
"#;

#[derive(Default)]
struct TemplateToolchain {
    generated: Mutex<Vec<TargetId>>,
    compiled: Mutex<Vec<TargetId>>,
}

impl TemplateToolchain {
    fn generated(&self) -> BTreeSet<TargetId> {
        self.generated.lock().unwrap().iter().cloned().collect()
    }
}

impl TargetBuilder for TemplateToolchain {
    fn generate(
        &self,
        target: &BuildTarget,
        _config: &BuildConfig,
        out_dir: &Path,
    ) -> Result<GeneratedFileSet> {
        self.generated.lock().unwrap().push(target.id.clone());
        let gen_dir = out_dir.join("gen");
        fs::create_dir_all(&gen_dir)?;

        let mut files = Vec::new();
        for source in target.sources().unwrap_or_default() {
            let name = source.file_name().unwrap().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".in") {
                let out = gen_dir.join(stem);
                fs::copy(source, &out)?;
                files.push(out);
            }
        }
        let vectors = gen_dir.join("vectors.c");
        fs::write(&vectors, "#include \"board.h\"\nvoid (*vectors[16])(void);\n")?;
        files.push(vectors);
        files.sort();
        Ok(GeneratedFileSet {
            files,
            traces: vec![],
        })
    }

    fn compile(
        &self,
        target: &BuildTarget,
        _config: &BuildConfig,
        _generated: &GeneratedFileSet,
        out_dir: &Path,
    ) -> Result<Vec<RawTrace>> {
        self.compiled.lock().unwrap().push(target.id.clone());
        let header = out_dir.join("gen").join("board.h");
        let main = target.module_dir().join("main.c");
        let vectors = out_dir.join("gen").join("vectors.c");
        Ok(vec![
            RawTrace {
                rule_target: Some(out_dir.join("obj/000_main.o")),
                source: main.clone(),
                edges: vec![(main, header.clone())],
            },
            RawTrace {
                rule_target: Some(out_dir.join("obj/001_vectors.o")),
                source: vectors.clone(),
                edges: vec![(vectors, header)],
            },
        ])
    }
}

struct Project {
    dir: tempfile::TempDir,
    config: FwConfig,
    settings: BuildSettings,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for module in ["uart", "spi"] {
            let module_dir = dir.path().join(module);
            fs::create_dir_all(&module_dir).unwrap();
            fs::write(
                module_dir.join("main.c"),
                format!("#include \"board.h\"\nvoid {}_init(void) {{}}\n", module),
            )
            .unwrap();
            fs::write(module_dir.join("board.h.in"), "#define CLOCK_HZ 48000000\n").unwrap();
        }
        let config: FwConfig = toml::from_str(CONFIG).unwrap();
        let settings = BuildSettings {
            jobs: 2,
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        };
        let settings = root_settings(settings, dir.path());
        Self {
            dir,
            config,
            settings,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn build(&self, toolchain: &TemplateToolchain) -> BuildReport {
        self.build_with(toolchain, &self.settings)
    }

    fn build_with(&self, toolchain: &TemplateToolchain, settings: &BuildSettings) -> BuildReport {
        let targets = targets_from_config(&self.config, self.root()).unwrap();
        let resolver = ManifestResolver::from_config(&self.config);
        let intermediates =
            intermediate_map(&self.config, &targets, &resolver, settings, self.root());
        let store = DiskStore::new(&settings.cache_dir);
        let logger = Logger::discard();
        let ctx = BuildContext {
            settings,
            store: &store,
            builder: toolchain,
            resolver: &resolver,
            intermediates: &intermediates,
            logger: &logger,
            progress: None,
        };
        run_build(targets, &ctx).expect("scheduler error")
    }
}

fn id(module: &str) -> TargetId {
    TargetId::new(module, "cortex-m4")
}

#[test]
fn test_unchanged_rebuild_hits_with_generated_units() {
    let project = Project::new();
    let first = TemplateToolchain::default();
    let report = project.build(&first);
    assert!(report.success());
    assert_eq!(first.generated().len(), 2);

    // The generated unit's trace is part of the stored history.
    let store = DiskStore::new(&project.settings.cache_dir);
    let record = store.load(&id("uart")).unwrap().unwrap();
    let sources: Vec<PathBuf> = record.dependencies.iter().map(|d| d.source.clone()).collect();
    assert!(sources.iter().any(|s| s.ends_with("gen/vectors.c")));
    // Both units include the generated header, recorded as its template.
    let template = project.root().join("uart/board.h.in");
    assert_eq!(record.dependencies.len(), 2);
    assert!(record.dependencies.iter().all(|d| d.includes == vec![template.clone()]));

    let second = TemplateToolchain::default();
    let report = project.build(&second);
    assert!(report.success());
    assert_eq!(report.hits(CachePhase::PreGen), 2);
    assert!(second.generated().is_empty());
    assert!(second.compiled.lock().unwrap().is_empty());
}

#[test]
fn test_editing_a_template_invalidates_only_its_target() {
    let project = Project::new();
    project.build(&TemplateToolchain::default());

    fs::write(
        project.root().join("spi/board.h.in"),
        "#define CLOCK_HZ 64000000\n",
    )
    .unwrap();

    let toolchain = TemplateToolchain::default();
    let report = project.build(&toolchain);
    assert!(report.success());
    assert_eq!(toolchain.generated(), BTreeSet::from([id("spi")]));
    assert_eq!(report.verdict(&id("spi"), CachePhase::PreGen), Some(false));
    assert_eq!(report.verdict(&id("uart"), CachePhase::PreGen), Some(true));
}

#[test]
fn test_identical_regeneration_skips_compile() {
    let project = Project::new();
    project.build(&TemplateToolchain::default());

    let settings = BuildSettings {
        pre_gen_cache: false,
        ..project.settings.clone()
    };
    let toolchain = TemplateToolchain::default();
    let report = project.build_with(&toolchain, &settings);
    assert!(report.success());
    assert_eq!(toolchain.generated().len(), 2);
    assert!(toolchain.compiled.lock().unwrap().is_empty());
    assert_eq!(report.hits(CachePhase::PostGen), 2);
}
