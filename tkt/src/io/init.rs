//! Project layout under `.tkt/` and the `tkt init` scaffold.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// All canonical paths within `.tkt/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub tkt_dir: PathBuf,
    pub pipeline_path: PathBuf,
    pub tickets_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub harnesses_dir: PathBuf,
    pub builds_dir: PathBuf,
    pub events_path: PathBuf,
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    pub stop_path: PathBuf,
    pub report_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tkt_dir = root.join(".tkt");
        Self {
            root: root.clone(),
            tkt_dir: tkt_dir.clone(),
            pipeline_path: tkt_dir.join("pipeline.toml"),
            tickets_dir: tkt_dir.join("tickets"),
            prompts_dir: tkt_dir.join("prompts"),
            skills_dir: tkt_dir.join("skills"),
            harnesses_dir: tkt_dir.join("harnesses"),
            builds_dir: tkt_dir.join("builds"),
            events_path: tkt_dir.join("events.jsonl"),
            lock_path: tkt_dir.join("loop.lock"),
            pid_path: tkt_dir.join("loop.pid"),
            log_path: tkt_dir.join("loop.log"),
            stop_path: tkt_dir.join("loop.stop"),
            report_path: tkt_dir.join("loop-report.json"),
            gitignore_path: tkt_dir.join(".gitignore"),
        }
    }

    /// Pipeline config present.
    pub fn is_provisioned(&self) -> bool {
        self.pipeline_path.is_file()
    }
}

/// Walk up from `start` to the nearest directory containing `.tkt/`.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".tkt").is_dir())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            anyhow!(
                "no .tkt directory found at or above {} (run `tkt init`)",
                start.display()
            )
        })
}

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite existing scaffold files.
    pub force: bool,
}

/// Create `.tkt/` scaffolding in `root`.
///
/// Fails if `.tkt/pipeline.toml` already exists unless `options.force` is set.
/// Tickets and build history are never touched.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.tkt_dir.exists() && !paths.tkt_dir.is_dir() {
        return Err(anyhow!("tkt init: .tkt exists but is not a directory"));
    }
    if paths.pipeline_path.exists() && !options.force {
        return Err(anyhow!(
            "tkt init: .tkt/pipeline.toml already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.tkt_dir,
        &paths.tickets_dir,
        &paths.prompts_dir,
        &paths.skills_dir,
        &paths.harnesses_dir,
        &paths.builds_dir,
    ] {
        create_dir(dir)?;
    }

    write_file(&paths.pipeline_path, SAMPLE_PIPELINE)?;
    write_file(&paths.prompts_dir.join("triage.md"), TRIAGE_PROMPT)?;
    write_file(&paths.prompts_dir.join("implement.md"), IMPLEMENT_PROMPT)?;
    write_file(&paths.gitignore_path, TKT_GITIGNORE)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

/// Pipeline written by `tkt init`.
pub const SAMPLE_PIPELINE: &str = r#"# Agent harness: claude, codex, gemini, or a name under .tkt/harnesses/.
agent = "claude"
max_retries = 2
max_depth = 3
discretion = "medium"
step_timeout = "15m"

# Shell hooks. Variables: {{ ticket }}, {{ changed_files }}, {{ workspace }}.
on_succeed = []
on_fail = []
on_close = []

[[workflows.main]]
name = "triage"
type = "decision"
prompt = "triage"
routes = ["feature"]

[[workflows.feature]]
name = "implement"
type = "action"
prompt = "implement"

[[workflows.feature]]
name = "verify"
type = "action"
run = "true"
"#;

const TRIAGE_PROMPT: &str = "# Triage\n\nRead the ticket and decide how to proceed. Route small, well-scoped work to `feature`. Decompose anything that needs more than one focused change.\n";
const IMPLEMENT_PROMPT: &str = "# Implement\n\nMake the change the ticket describes. Keep the diff focused and leave the project building.\n";
const TKT_GITIGNORE: &str = "builds/\nevents.jsonl\nloop.*\nloop-report.json\n";
