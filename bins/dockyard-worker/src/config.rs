// Toolchain configuration management for the dockyard worker
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// In-container mount point of the staged project tree.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// In-container path of a compiled artifact, for toolchains with a compile step.
pub const ARTIFACT_PATH: &str = "/tmp/program";

/// Placeholder tokens permitted in command templates. Anything else in braces
/// is rejected at command-build time, so user-influenced data can never smuggle
/// its own substitution into a template.
const ALLOWED_PLACEHOLDERS: &[&str] = &["{file}", "{dir}", "{bin}"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolchain {
    pub name: String,
    pub version: String,
    pub image: String,
    pub file_extension: String,
    /// Absent for interpreted languages: the run command executes directly.
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
}

impl Toolchain {
    /// Build the shell command that compiles (if applicable) and runs the
    /// staged file, with and-then semantics: a failed compile aborts the run.
    ///
    /// Every argument is produced by placeholder substitution over a static
    /// template and then shell-quoted, so file names with quotes, spaces or
    /// backslashes cannot break out of their argv slot. Stdin never appears
    /// here at all: it is fed through the process's input stream.
    pub fn build_shell_command(&self, staged_file: &str) -> Result<String> {
        let file_in_container = format!("{}/{}", WORKSPACE_MOUNT, staged_file);
        let mut stages = Vec::new();
        if let Some(compile) = &self.compile_command {
            stages.push(render_argv(compile, &file_in_container)?);
        }
        stages.push(render_argv(&self.run_command, &file_in_container)?);

        let joined: Vec<String> = stages
            .iter()
            .map(|argv| {
                argv.iter()
                    .map(|arg| quote_arg(arg))
                    .collect::<Result<Vec<_>>>()
                    .map(|parts| parts.join(" "))
            })
            .collect::<Result<_>>()?;
        Ok(joined.join(" && "))
    }
}

/// Substitute the allow-listed placeholders into one argv template.
///
/// Single pass over the template text: substituted values are appended
/// verbatim and never re-scanned, so a file name that itself contains a
/// brace token cannot trigger a second substitution.
fn render_argv(template: &[String], file_in_container: &str) -> Result<Vec<String>> {
    template
        .iter()
        .map(|arg| render_arg(arg, file_in_container))
        .collect()
}

fn render_arg(arg: &str, file_in_container: &str) -> Result<String> {
    let mut rendered = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        rest = &rest[start..];
        let Some(end) = rest.find('}') else {
            // Unbalanced brace: literal text, not a token.
            break;
        };
        let token = &rest[..=end];
        match token {
            "{file}" => rendered.push_str(file_in_container),
            "{dir}" => rendered.push_str(WORKSPACE_MOUNT),
            "{bin}" => rendered.push_str(ARTIFACT_PATH),
            _ => bail!(
                "command template argument '{}' uses placeholder {} outside the allowed set {:?}",
                arg,
                token,
                ALLOWED_PLACEHOLDERS
            ),
        }
        rest = &rest[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn quote_arg(arg: &str) -> Result<String> {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        .map_err(|_| anyhow::anyhow!("argument contains a nul byte"))
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<Toolchain>,
}

/// Registry of configured language toolchains.
/// This is the authoritative source for which languages are enabled.
#[derive(Clone)]
pub struct ToolchainManager {
    toolchains: HashMap<String, Toolchain>,
}

impl ToolchainManager {
    /// Load toolchain configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("language config file not found: {}", config_path.display());
        }

        let content =
            fs::read_to_string(config_path).context("Failed to read languages.json")?;
        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        if languages_json.languages.is_empty() {
            bail!("no languages configured in {}", config_path.display());
        }

        let mut toolchains = HashMap::new();
        for toolchain in languages_json.languages {
            toolchains.insert(toolchain.name.clone(), toolchain);
        }
        Ok(Self { toolchains })
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    pub fn get(&self, language: &str) -> Option<&Toolchain> {
        self.toolchains.get(language)
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.toolchains.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(compile: Option<Vec<&str>>, run: Vec<&str>) -> Toolchain {
        Toolchain {
            name: "test".to_string(),
            version: "1".to_string(),
            image: "dockyard-test:latest".to_string(),
            file_extension: ".t".to_string(),
            compile_command: compile.map(|v| v.iter().map(|s| s.to_string()).collect()),
            run_command: run.iter().map(|s| s.to_string()).collect(),
            timeout_ms: 5000,
            memory_limit_mb: 256,
            cpu_limit: 0.5,
        }
    }

    #[test]
    fn interpreted_language_runs_directly() {
        let tc = toolchain(None, vec!["python3", "-u", "{file}"]);
        let cmd = tc.build_shell_command("main.py").unwrap();
        assert_eq!(cmd, "python3 -u /workspace/main.py");
    }

    #[test]
    fn compile_step_chains_before_run() {
        let tc = toolchain(
            Some(vec!["rustc", "{file}", "-o", "{bin}"]),
            vec!["{bin}"],
        );
        let cmd = tc.build_shell_command("main.rs").unwrap();
        assert_eq!(
            cmd,
            "rustc /workspace/main.rs -o /tmp/program && /tmp/program"
        );
    }

    #[test]
    fn hostile_file_name_is_quoted_into_one_argv_slot() {
        let tc = toolchain(None, vec!["python3", "{file}"]);
        let cmd = tc
            .build_shell_command("a'; rm -rf / #.py")
            .unwrap();
        // The whole path must survive as a single quoted token.
        let parts = shlex::split(&cmd).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], "/workspace/a'; rm -rf / #.py");
    }

    #[test]
    fn backslashes_and_quotes_survive_quoting() {
        let tc = toolchain(None, vec!["cat", "{file}"]);
        let cmd = tc.build_shell_command(r#"we"ird\name.txt"#).unwrap();
        let parts = shlex::split(&cmd).unwrap();
        assert_eq!(parts[1], r#"/workspace/we"ird\name.txt"#);
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let tc = toolchain(None, vec!["python3", "{evil}"]);
        assert!(tc.build_shell_command("main.py").is_err());
    }

    #[test]
    fn loads_shipped_languages_file() {
        let manager = ToolchainManager::load(Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/languages.json")
            .as_path());
        let manager = manager.expect("shipped languages.json must parse");
        let python = manager.get("python").expect("python is configured");
        assert!(python.compile_command.is_none());
        let rust = manager.get("rust").expect("rust is configured");
        assert!(rust.compile_command.is_some());
        // Compiled languages get the longer limit.
        assert!(rust.timeout_ms > python.timeout_ms);
        assert!(manager.get("brainfuck").is_none());
    }
}
