use crate::config::FwConfig;
use anyhow::{Context, Result, anyhow, bail};
use std::fs;
use std::path::Path;
use std::process::Command;

pub const CONFIG_FILE: &str = "fwbuild.toml";

// --- Helper: Load Config ---
pub fn load_config(project_dir: &Path) -> Result<FwConfig> {
    let path = project_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Err(anyhow!(
            "{} not found in {}.\n\n\
            💡 Tip: Run 'fwb' from the firmware tree root, or pass --dir <path>.",
            CONFIG_FILE,
            project_dir.display()
        ));
    }
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {} - check file permissions", CONFIG_FILE))?;
    let config: FwConfig = toml::from_str(&config_str).with_context(|| {
        format!(
            "Failed to parse {} - check for syntax errors (missing quotes, brackets)",
            CONFIG_FILE
        )
    })?;
    if config.targets.is_empty() {
        bail!("{} declares no [[target]] entries", CONFIG_FILE);
    }
    Ok(config)
}

/// Substitute `{key}` placeholders.
pub fn expand(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Quote a path for the shell when it needs it.
pub fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        if cfg!(target_os = "windows") {
            format!("\"{}\"", s)
        } else {
            format!("'{}'", s.replace('\'', r"'\''"))
        }
    } else {
        s.to_string()
    }
}

/// Captured output of a successful command.
#[derive(Debug, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
}

// --- Helper: Run Script (Cross Platform) ---
/// Run a shell command, or a `.rhai` script when the command names one.
/// Script variables are exported as `FWB_<NAME>` to shell commands and as
/// plain scope variables to rhai.
pub fn run_script(
    script: &str,
    project_dir: &Path,
    vars: &[(&str, String)],
) -> Result<ScriptOutput> {
    let trimmed = script.trim();
    if trimmed.ends_with(".rhai") && !trimmed.contains(char::is_whitespace) {
        return run_rhai(&project_dir.join(trimmed), vars);
    }

    let command = expand(trimmed, vars);
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", &command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", &command]);
        c
    };
    cmd.current_dir(project_dir);
    for (key, value) in vars {
        cmd.env(format!("FWB_{}", key.to_ascii_uppercase()), value);
    }

    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute '{}'", command))?;
    let result = ScriptOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    if !output.status.success() {
        let detail = if result.stderr.trim().is_empty() {
            result.stdout.trim()
        } else {
            result.stderr.trim()
        };
        bail!("Command '{}' failed ({}):\n{}", command, output.status, detail);
    }
    Ok(result)
}

fn run_rhai(path: &Path, vars: &[(&str, String)]) -> Result<ScriptOutput> {
    if !path.exists() {
        bail!("Rhai script {} not found", path.display());
    }
    let mut engine = rhai::Engine::new();
    engine.register_fn("write_file", |path: &str, content: &str| {
        fs::write(path, content).is_ok()
    });
    engine.register_fn("read_file", |path: &str| fs::read_to_string(path).unwrap_or_default());

    let mut scope = rhai::Scope::new();
    for (key, value) in vars {
        scope.push(key.to_string(), value.clone());
    }
    engine
        .run_file_with_scope(&mut scope, path.to_path_buf())
        .map_err(|e| anyhow!("Rhai script {} failed: {}", path.display(), e))?;
    Ok(ScriptOutput::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_placeholders() {
        let vars = [("module", "hal/gpio".to_string()), ("arch", "rv32".to_string())];
        assert_eq!(
            expand("gen {module} --arch={arch} {unknown}", &vars),
            "gen hal/gpio --arch=rv32 {unknown}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("a/b.c")), "a/b.c");
        assert_eq!(shell_quote(Path::new("my dir/b.c")), "'my dir/b.c'");
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("fwbuild.toml not found"));
    }

    #[test]
    fn test_load_config_requires_targets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[project]\nname = \"fw\"\n").unwrap();
        assert!(load_config(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_script_exports_vars_and_captures_failure() {
        let dir = tempfile::tempdir().unwrap();
        let vars = [("module", "app".to_string())];
        let out = run_script("echo {module} $FWB_MODULE", dir.path(), &vars).unwrap();
        assert_eq!(out.stdout.trim(), "app app");

        let err = run_script("echo boom >&2; exit 3", dir.path(), &[]).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_run_rhai_script() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        fs::write(
            dir.path().join("gen.rhai"),
            "write_file(out, \"arch=\" + arch);",
        )
        .unwrap();
        let vars = [
            ("out", target.to_string_lossy().to_string()),
            ("arch", "m4".to_string()),
        ];
        run_script("gen.rhai", dir.path(), &vars).unwrap();
        assert_eq!(fs::read_to_string(target).unwrap(), "arch=m4");
    }
}
