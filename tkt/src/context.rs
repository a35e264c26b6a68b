//! Explicit context threaded through builds and loops.

use std::ffi::OsStr;

use anyhow::{Result, bail};

use crate::core::pipeline::PipelineSpec;
use crate::io::artifacts::BuildArtifacts;
use crate::io::events::EventLog;
use crate::io::executor::Executor;
use crate::io::hooks::HookRunner;
use crate::io::init::ProjectPaths;
use crate::io::prompt::PromptBuilder;
use crate::io::ticket_store::TicketStore;

/// Set to `1` in every process spawned while a loop is running.
pub const LOOP_GUARD_ENV: &str = "TKT_LOOP_GUARD";

/// Collaborators and settings shared by every step of a build.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub paths: &'a ProjectPaths,
    pub pipeline: &'a PipelineSpec,
    pub store: &'a dyn TicketStore,
    pub executor: &'a dyn Executor,
    pub hooks: &'a dyn HookRunner,
    pub events: &'a EventLog,
    pub prompts: &'a PromptBuilder,
    /// Suppresses ticket creation by spawned agents while a loop runs.
    pub loop_guard: bool,
}

impl<'a> BuildContext<'a> {
    pub fn with_loop_guard(self) -> Self {
        Self {
            loop_guard: true,
            ..self
        }
    }

    /// Environment handed to agents, shell nodes, and hooks.
    pub fn process_env(
        &self,
        ticket_id: &str,
        artifacts: Option<&BuildArtifacts>,
    ) -> Vec<(String, String)> {
        let mut env = vec![("TKT_TICKET_ID".to_string(), ticket_id.to_string())];
        if let Some(artifacts) = artifacts {
            env.push((
                "TKT_BUILD_DIR".to_string(),
                artifacts.dir.display().to_string(),
            ));
            env.push((
                "TKT_WORKSPACE".to_string(),
                artifacts.workspace_dir.display().to_string(),
            ));
        }
        if self.loop_guard {
            env.push((LOOP_GUARD_ENV.to_string(), "1".to_string()));
        }
        env
    }
}

/// Refuse ticket creation when `guard` (the value of `TKT_LOOP_GUARD`) marks
/// a process spawned by a running loop.
pub fn ensure_creation_allowed(guard: Option<&OsStr>) -> Result<()> {
    if guard.is_some_and(|value| value == "1") {
        bail!("ticket creation is disabled while a loop is running ({LOOP_GUARD_ENV}=1)");
    }
    Ok(())
}
