//! Lifecycle hooks: shell commands run on success, failure, and close.

use std::path::{Path, PathBuf};
use std::time::Duration;

use minijinja::{Environment, context};
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout, shell_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Succeed,
    Fail,
    Close,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPhase::Succeed => "on_succeed",
            HookPhase::Fail => "on_fail",
            HookPhase::Close => "on_close",
        }
    }
}

/// Values available to hook commands.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub ticket: String,
    pub changed_files: Vec<String>,
    /// Build workspace dir; empty during recovery when no build dir is known.
    pub workspace: PathBuf,
    /// Environment inherited from the build (loop guard, build dir).
    pub env: Vec<(String, String)>,
}

impl HookContext {
    fn env(&self) -> Vec<(String, String)> {
        let mut env = self.env.clone();
        env.push(("TKT_TICKET_ID".to_string(), self.ticket.clone()));
        env.push(("TKT_CHANGED_FILES".to_string(), self.changed_files.join("\n")));
        env.push((
            "TKT_WORKSPACE".to_string(),
            self.workspace.display().to_string(),
        ));
        env
    }

    /// Expand `{{ ticket }}`, `{{ changed_files }}`, and `{{ workspace }}` in a command.
    pub fn render(&self, command: &str) -> Result<String, ExecutionError> {
        let env = Environment::new();
        env.render_str(
            command,
            context! {
                ticket => &self.ticket,
                changed_files => self.changed_files.join(" "),
                workspace => self.workspace.display().to_string(),
            },
        )
        .map_err(|err| ExecutionError::Harness(format!("render hook '{command}': {err}")))
    }
}

#[derive(Debug, Clone)]
pub struct HookRequest<'a> {
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a [(String, String)],
    pub timeout: Duration,
}

pub trait HookRunner {
    fn run(&self, request: &HookRequest<'_>) -> Result<(), ExecutionError>;
}

/// Runs hooks with `sh -c`.
pub struct ShellHookRunner;

impl HookRunner for ShellHookRunner {
    fn run(&self, request: &HookRequest<'_>) -> Result<(), ExecutionError> {
        let cmd = shell_command(request.command, request.cwd, request.env);
        let output =
            run_command_with_timeout(cmd, None, request.timeout, DEFAULT_OUTPUT_LIMIT_BYTES)
                .map_err(|err| ExecutionError::Spawn {
                    program: "sh".to_string(),
                    message: format!("{err:#}"),
                })?;
        if output.timed_out {
            return Err(ExecutionError::Timeout {
                after: request.timeout,
            });
        }
        if !output.status.success() {
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                output: output.combined(),
            });
        }
        Ok(())
    }
}

/// A hook in a phase failed; the remaining hooks of that phase were skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub phase: HookPhase,
    pub command: String,
    pub error: ExecutionError,
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} hook `{}` failed: {}",
            self.phase.as_str(),
            self.command,
            self.error
        )
    }
}

/// Run a phase's hooks in order, stopping at the first failure.
pub fn run_hooks<R: HookRunner + ?Sized>(
    runner: &R,
    phase: HookPhase,
    commands: &[String],
    ctx: &HookContext,
    cwd: &Path,
    timeout: Duration,
) -> Result<(), HookFailure> {
    let env = ctx.env();
    for raw in commands {
        let fail = |error| HookFailure {
            phase,
            command: raw.clone(),
            error,
        };
        let command = ctx.render(raw).map_err(fail)?;
        debug!(phase = phase.as_str(), command = %command, "running hook");
        runner
            .run(&HookRequest {
                command: &command,
                cwd,
                env: &env,
                timeout,
            })
            .map_err(fail)?;
    }
    if !commands.is_empty() {
        info!(phase = phase.as_str(), count = commands.len(), "hooks passed");
    }
    Ok(())
}

/// Like [`run_hooks`], but a failure is only logged.
pub fn run_hooks_best_effort<R: HookRunner + ?Sized>(
    runner: &R,
    phase: HookPhase,
    commands: &[String],
    ctx: &HookContext,
    cwd: &Path,
    timeout: Duration,
) {
    if let Err(failure) = run_hooks(runner, phase, commands, ctx, cwd, timeout) {
        warn!(ticket = %ctx.ticket, "{failure}");
    }
}
