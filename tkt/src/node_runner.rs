//! Single-node execution and the retry policy around it.

use tracing::{debug, instrument, warn};

use crate::context::BuildContext;
use crate::core::disposition::parse_disposition;
use crate::core::pipeline::{NodeSettings, NodeSpec, NodeTask, Workflow};
use crate::core::types::NodeResult;
use crate::error::ExecutionError;
use crate::io::artifacts::BuildArtifacts;
use crate::io::executor::AgentRequest;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout, shell_command};
use crate::io::prompt::{NamedText, PromptInputs, load_prompt, load_skill};
use crate::ticket::Ticket;

/// Run `attempt` up to `max_retries + 1` times, with no delay between attempts.
///
/// Only the error arm is retried. `on_retry` sees the attempt number (1-based)
/// that just failed and its error. The last error is returned once attempts run out.
pub fn run_with_retries<T>(
    max_retries: u32,
    mut attempt: impl FnMut(u32) -> Result<T, ExecutionError>,
    mut on_retry: impl FnMut(u32, &ExecutionError),
) -> Result<T, ExecutionError> {
    let total = max_retries.saturating_add(1);
    let mut n = 1;
    loop {
        match attempt(n) {
            Ok(value) => return Ok(value),
            Err(err) if n < total => {
                on_retry(n, &err);
                n += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Where a node sits in the active workflow.
#[derive(Debug, Clone, Copy)]
pub struct NodeLocation<'a> {
    pub workflow_name: &'a str,
    pub workflow: &'a Workflow,
    pub node: &'a NodeSpec,
    pub index: usize,
}

/// One attempt at one node.
///
/// Decision-node output that cannot be parsed into a disposition is an
/// execution error, so it is retried like a crash.
#[instrument(skip_all, fields(ticket = %ticket.id, workflow = at.workflow_name, node = %at.node.name))]
pub fn run_node(
    ctx: &BuildContext<'_>,
    ticket: &Ticket,
    artifacts: &BuildArtifacts,
    at: NodeLocation<'_>,
) -> Result<NodeResult, ExecutionError> {
    let node = at.node;
    let settings = ctx.pipeline.settings_for(at.workflow, node);
    let env = ctx.process_env(&ticket.id, Some(artifacts));

    let task = node.task().ok_or_else(|| {
        ExecutionError::Harness(format!(
            "node '{}' must have exactly one of prompt, run, skill",
            node.name
        ))
    })?;

    let result = match task {
        NodeTask::Run(command) => run_shell(ctx, command, &env, settings.timeout),
        NodeTask::Prompt(name) => load_prompt(&ctx.paths.prompts_dir, name)
            .and_then(|text| run_agent_node(ctx, ticket, artifacts, at, &text, &env, &settings)),
        NodeTask::Skill(name) => load_skill(&ctx.paths.skills_dir, name)
            .and_then(|text| run_agent_node(ctx, ticket, artifacts, at, &text, &env, &settings)),
    };

    let raw = match &result {
        Ok(output) => output.clone(),
        Err(err) => format!("[attempt failed: {err}]\n"),
    };
    if let Err(err) = artifacts.write_node_output(at.workflow_name, &node.name, &raw) {
        warn!(err = %format!("{err:#}"), "failed to write node output");
    }
    let output = result?;

    if node.is_decision() {
        let disposition = parse_disposition(&output)?;
        debug!(disposition = disposition.kind(), "decision parsed");
        return Ok(NodeResult::Signal {
            disposition,
            output,
        });
    }

    artifacts
        .write_workspace(at.workflow_name, &node.name, &output)
        .map_err(ExecutionError::io)?;
    Ok(NodeResult::Success { output })
}

fn run_agent_node(
    ctx: &BuildContext<'_>,
    ticket: &Ticket,
    artifacts: &BuildArtifacts,
    at: NodeLocation<'_>,
    instructions: &str,
    env: &[(String, String)],
    settings: &NodeSettings,
) -> Result<String, ExecutionError> {
    let node = at.node;
    let skills = node
        .skills
        .iter()
        .map(|name| {
            load_skill(&ctx.paths.skills_dir, name).map(|text| NamedText {
                name: name.clone(),
                text,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let earlier: Vec<&str> = at.workflow.nodes[..at.index]
        .iter()
        .map(|n| n.name.as_str())
        .collect();
    let prior = artifacts.prior_outputs(at.workflow_name, &earlier);
    let prompt = ctx
        .prompts
        .build(&PromptInputs {
            ticket,
            workflow: at.workflow_name,
            node: &node.name,
            instructions,
            skills: &skills,
            prior: &prior,
            decision_routes: node.is_decision().then_some(node.routes.as_slice()),
            discretion: ctx.pipeline.discretion,
        })
        .map_err(ExecutionError::io)?;
    debug!(bytes = prompt.len(), "built prompt");
    let prompt_file = artifacts.prompt_path(at.workflow_name, &node.name);
    ctx.executor.run_agent(&AgentRequest {
        agent: &ctx.pipeline.agent,
        prompt: &prompt,
        model: settings.model.as_deref(),
        system_prompt: ctx.pipeline.system_prompt.as_deref(),
        allow_all: settings.allow_all,
        allowed_tools: settings.allowed_tools.as_deref(),
        workdir: &ctx.paths.root,
        env,
        timeout: settings.timeout,
        prompt_file: &prompt_file,
    })
}

fn run_shell(
    ctx: &BuildContext<'_>,
    command: &str,
    env: &[(String, String)],
    timeout: std::time::Duration,
) -> Result<String, ExecutionError> {
    let cmd = shell_command(command, &ctx.paths.root, env);
    let output = run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT_BYTES).map_err(
        |err| ExecutionError::Spawn {
            program: "sh".to_string(),
            message: format!("{err:#}"),
        },
    )?;
    if output.timed_out {
        return Err(ExecutionError::Timeout { after: timeout });
    }
    if !output.status.success() {
        return Err(ExecutionError::NonZeroExit {
            code: output.status.code(),
            output: output.combined(),
        });
    }
    Ok(output.combined())
}
