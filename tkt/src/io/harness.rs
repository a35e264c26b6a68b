//! Agent harnesses: how a named agent turns into a process invocation.
//!
//! A harness is either templated (a binary plus argument template) or a shell
//! script that receives its inputs through `TKT_*` environment variables. A
//! script reads the prompt from the file named by `TKT_PROMPT_FILE`, since a
//! single environment string is capped at 128 KiB on Linux.
//! Lookup order for a name: project `.tkt/harnesses/`, the user config
//! directory, then the built-ins compiled into this binary.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::ExecutionError;

const BUILTIN_CLAUDE: &str = include_str!("harnesses/claude.toml");
const BUILTIN_CODEX: &str = include_str!("harnesses/codex.toml");
const BUILTIN_GEMINI: &str = include_str!("harnesses/gemini.sh");

/// Templated harness definition (`<name>.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplatedHarness {
    /// Candidate binaries; the first one found on `PATH` is used.
    pub binaries: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt_via_stdin: bool,
    #[serde(default)]
    pub model_args: Vec<String>,
    #[serde(default)]
    pub system_prompt_args: Vec<String>,
    #[serde(default)]
    pub allow_all_args: Vec<String>,
    #[serde(default)]
    pub allowed_tools_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessKind {
    Templated(TemplatedHarness),
    Script(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harness {
    pub name: String,
    pub kind: HarnessKind,
}

/// Inputs for one agent invocation.
#[derive(Debug, Clone)]
pub struct HarnessRequest<'a> {
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
    pub allow_all: bool,
    pub allowed_tools: Option<&'a [String]>,
    pub workdir: &'a Path,
    /// Where a script harness finds the prompt; written before the spawn.
    pub prompt_file: &'a Path,
}

/// A fully resolved process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Harness {
    /// Resolve to a concrete invocation. Binaries are looked up now, not at load time.
    #[instrument(skip_all, fields(harness = %self.name))]
    pub fn invocation(&self, request: &HarnessRequest<'_>) -> Result<Invocation, ExecutionError> {
        match &self.kind {
            HarnessKind::Templated(template) => template_invocation(template, request),
            HarnessKind::Script(path) => script_invocation(path, request),
        }
    }
}

fn template_invocation(
    template: &TemplatedHarness,
    request: &HarnessRequest<'_>,
) -> Result<Invocation, ExecutionError> {
    let program = template
        .binaries
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
        .ok_or_else(|| {
            ExecutionError::Harness(format!(
                "none of [{}] found on PATH",
                template.binaries.join(", ")
            ))
        })?;
    debug!(program = %program.display(), "resolved harness binary");

    let tools = request.allowed_tools.map(|tools| tools.join(","));
    let fill = |arg: &String| {
        arg.replace("{prompt}", request.prompt)
            .replace("{model}", request.model.unwrap_or_default())
            .replace("{system_prompt}", request.system_prompt.unwrap_or_default())
            .replace("{allowed_tools}", tools.as_deref().unwrap_or_default())
    };

    let mut args: Vec<String> = template.args.iter().map(fill).collect();
    if request.model.is_some() {
        args.extend(template.model_args.iter().map(fill));
    }
    if request.system_prompt.is_some() {
        args.extend(template.system_prompt_args.iter().map(fill));
    }
    if request.allow_all {
        args.extend(template.allow_all_args.iter().map(fill));
    } else if tools.is_some() {
        args.extend(template.allowed_tools_args.iter().map(fill));
    }

    Ok(Invocation {
        program,
        args,
        env: Vec::new(),
        stdin: template
            .prompt_via_stdin
            .then(|| request.prompt.to_string()),
    })
}

fn script_invocation(
    path: &Path,
    request: &HarnessRequest<'_>,
) -> Result<Invocation, ExecutionError> {
    if let Some(parent) = request.prompt_file.parent() {
        fs::create_dir_all(parent).map_err(ExecutionError::io)?;
    }
    fs::write(request.prompt_file, request.prompt).map_err(ExecutionError::io)?;
    let env = vec![
        (
            "TKT_PROMPT_FILE".to_string(),
            request.prompt_file.display().to_string(),
        ),
        (
            "TKT_MODEL".to_string(),
            request.model.unwrap_or_default().to_string(),
        ),
        (
            "TKT_SYSTEM_PROMPT".to_string(),
            request.system_prompt.unwrap_or_default().to_string(),
        ),
        (
            "TKT_ALLOW_ALL".to_string(),
            if request.allow_all { "1" } else { "0" }.to_string(),
        ),
        (
            "TKT_ALLOWED_TOOLS".to_string(),
            request
                .allowed_tools
                .map(|tools| tools.join(","))
                .unwrap_or_default(),
        ),
        (
            "TKT_WORKDIR".to_string(),
            request.workdir.display().to_string(),
        ),
    ];
    Ok(Invocation {
        program: PathBuf::from("sh"),
        args: vec![path.display().to_string()],
        env,
        stdin: None,
    })
}

/// Search path for harness definitions.
#[derive(Debug, Clone)]
pub struct HarnessRegistry {
    project_dir: PathBuf,
    user_dir: Option<PathBuf>,
    cache_dir: PathBuf,
}

impl HarnessRegistry {
    pub fn new(project_dir: PathBuf, user_dir: Option<PathBuf>, cache_dir: PathBuf) -> Self {
        Self {
            project_dir,
            user_dir,
            cache_dir,
        }
    }

    /// Registry for a project, using the platform config and cache directories.
    pub fn for_project(project_harness_dir: &Path) -> Self {
        let user_dir = dirs::config_dir().map(|dir| dir.join("tkt").join("harnesses"));
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tkt")
            .join("harnesses");
        Self::new(project_harness_dir.to_path_buf(), user_dir, cache_dir)
    }

    #[instrument(skip(self))]
    pub fn resolve(&self, name: &str) -> Result<Harness, ExecutionError> {
        if name.is_empty() || name.contains('/') {
            return Err(ExecutionError::Harness(format!(
                "invalid harness name '{name}'"
            )));
        }
        let dirs = std::iter::once(&self.project_dir).chain(self.user_dir.as_ref());
        for dir in dirs {
            if let Some(harness) = load_from_dir(dir, name)? {
                debug!(dir = %dir.display(), "found harness definition");
                return Ok(harness);
            }
        }
        self.builtin(name)
    }

    fn builtin(&self, name: &str) -> Result<Harness, ExecutionError> {
        let kind = match name {
            "claude" => HarnessKind::Templated(parse_template(name, BUILTIN_CLAUDE)?),
            "codex" => HarnessKind::Templated(parse_template(name, BUILTIN_CODEX)?),
            "gemini" => HarnessKind::Script(self.materialize(name, BUILTIN_GEMINI)?),
            _ => {
                return Err(ExecutionError::Harness(format!(
                    "unknown harness '{name}' (expected claude, codex, gemini, or a definition in .tkt/harnesses)"
                )));
            }
        };
        Ok(Harness {
            name: name.to_string(),
            kind,
        })
    }

    /// Write an embedded script into the cache dir unless an identical copy exists.
    fn materialize(&self, name: &str, script: &str) -> Result<PathBuf, ExecutionError> {
        let path = self.cache_dir.join(format!("{name}.sh"));
        if fs::read_to_string(&path).is_ok_and(|existing| existing == script) {
            return Ok(path);
        }
        fs::create_dir_all(&self.cache_dir).map_err(ExecutionError::io)?;
        fs::write(&path, script).map_err(ExecutionError::io)?;
        debug!(path = %path.display(), "materialized built-in harness");
        Ok(path)
    }
}

fn load_from_dir(dir: &Path, name: &str) -> Result<Option<Harness>, ExecutionError> {
    let toml_path = dir.join(format!("{name}.toml"));
    if toml_path.is_file() {
        let raw = fs::read_to_string(&toml_path).map_err(ExecutionError::io)?;
        return Ok(Some(Harness {
            name: name.to_string(),
            kind: HarnessKind::Templated(parse_template(name, &raw)?),
        }));
    }
    let script_path = dir.join(format!("{name}.sh"));
    if script_path.is_file() {
        return Ok(Some(Harness {
            name: name.to_string(),
            kind: HarnessKind::Script(script_path),
        }));
    }
    Ok(None)
}

fn parse_template(name: &str, raw: &str) -> Result<TemplatedHarness, ExecutionError> {
    let template: TemplatedHarness = toml::from_str(raw)
        .map_err(|err| ExecutionError::Harness(format!("parse harness '{name}': {err}")))?;
    if template.binaries.is_empty() {
        return Err(ExecutionError::Harness(format!(
            "harness '{name}' lists no binaries"
        )));
    }
    Ok(template)
}
