//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples node execution from how agents are
//! launched. [`HarnessExecutor`] resolves a harness and spawns it; tests use
//! scripted executors that return predetermined outputs without spawning
//! processes.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::ExecutionError;
use crate::io::harness::{HarnessRegistry, HarnessRequest};
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    /// Harness name (`claude`, `codex`, `gemini`, or a project definition).
    pub agent: &'a str,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
    pub allow_all: bool,
    pub allowed_tools: Option<&'a [String]>,
    /// Working directory for the agent process.
    pub workdir: &'a Path,
    /// Extra environment (ticket id, build dir, loop guard).
    pub env: &'a [(String, String)],
    /// File that receives the prompt when the harness reads it from disk.
    pub prompt_file: &'a Path,
    pub timeout: Duration,
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run the agent to completion and return what it printed.
    fn run_agent(&self, request: &AgentRequest<'_>) -> Result<String, ExecutionError>;
}

/// Executor that spawns the process described by a harness.
#[derive(Debug, Clone)]
pub struct HarnessExecutor {
    registry: HarnessRegistry,
    output_limit_bytes: usize,
}

impl HarnessExecutor {
    pub fn new(registry: HarnessRegistry) -> Self {
        Self {
            registry,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl Executor for HarnessExecutor {
    #[instrument(skip_all, fields(agent = request.agent, timeout_secs = request.timeout.as_secs()))]
    fn run_agent(&self, request: &AgentRequest<'_>) -> Result<String, ExecutionError> {
        let harness = self.registry.resolve(request.agent)?;
        let invocation = harness.invocation(&HarnessRequest {
            prompt: request.prompt,
            model: request.model,
            system_prompt: request.system_prompt,
            allow_all: request.allow_all,
            allowed_tools: request.allowed_tools,
            workdir: request.workdir,
            prompt_file: request.prompt_file,
        })?;
        info!(program = %invocation.program.display(), "starting agent");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).current_dir(request.workdir);
        for (key, value) in invocation.env.iter().chain(request.env) {
            cmd.env(key, value);
        }

        let output = run_command_with_timeout(
            cmd,
            invocation.stdin.as_deref().map(str::as_bytes),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| ExecutionError::Spawn {
            program: invocation.program.display().to_string(),
            message: format!("{err:#}"),
        })?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(ExecutionError::Timeout {
                after: request.timeout,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                output: output.combined(),
            });
        }

        debug!(bytes = output.stdout.len(), "agent completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
