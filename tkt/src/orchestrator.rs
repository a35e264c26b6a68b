//! The build state machine: drives one ticket through the workflow graph.
//!
//! Every branch reloads the ticket before mutating it and persists before
//! returning, so a killed build leaves a ticket that `recover_interrupted`
//! can put back in the queue.

use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::context::BuildContext;
use crate::core::disposition::Disposition;
use crate::core::pipeline::{MAIN_WORKFLOW, Workflow};
use crate::core::selector::check_eligibility;
use crate::core::types::{BuildOutcome, NodeResult};
use crate::error::BuildError;
use crate::io::artifacts::BuildArtifacts;
use crate::io::events::EventKind;
use crate::io::hooks::{HookContext, HookPhase, run_hooks, run_hooks_best_effort};
use crate::io::snapshot::WorkspaceSnapshot;
use crate::node_runner::{NodeLocation, run_node, run_with_retries};
use crate::ticket::{Status, Ticket, generate_short_id};

/// Check eligibility, then build the ticket to a terminal outcome.
#[instrument(skip(ctx))]
pub fn build_ticket(ctx: &BuildContext<'_>, id: &str) -> Result<BuildOutcome, BuildError> {
    let ticket = ctx.store.load(id)?;
    let open = ctx.store.open_deps(&ticket)?;
    check_eligibility(&ticket, &open)?;
    run_build(ctx, ticket)
}

fn run_build(ctx: &BuildContext<'_>, mut ticket: Ticket) -> Result<BuildOutcome, BuildError> {
    let before = WorkspaceSnapshot::capture(&ctx.paths.root);
    let artifacts = BuildArtifacts::create(&ctx.paths.builds_dir, &ticket, Utc::now())?;
    ticket.set_status(Status::InProgress);
    ctx.store.save(&ticket)?;
    info!(ticket = %ticket.id, build = %artifacts.name(), "build started");

    let mut run = BuildRun {
        ctx: *ctx,
        id: ticket.id,
        artifacts,
        before,
        visits: HashMap::new(),
    };
    let outcome = run.drive()?;
    ctx.events.emit(
        EventKind::BuildComplete,
        Some(run.id.as_str()),
        json!({
            "build": run.artifacts.name(),
            "outcome": outcome,
        }),
    );
    info!(ticket = %run.id, outcome = outcome.kind(), "build finished");
    Ok(outcome)
}

struct BuildRun<'a> {
    ctx: BuildContext<'a>,
    id: String,
    artifacts: BuildArtifacts,
    before: WorkspaceSnapshot,
    /// Per-build visit counters keyed by node name (names are globally unique).
    visits: HashMap<String, u32>,
}

impl<'a> BuildRun<'a> {
    fn drive(&mut self) -> Result<BuildOutcome, BuildError> {
        let ctx = self.ctx;
        let mut workflow_name = MAIN_WORKFLOW.to_string();
        'workflows: loop {
            let workflow = ctx.pipeline.workflow(&workflow_name).ok_or_else(|| {
                BuildError::Config(anyhow!("workflow '{workflow_name}' is not defined"))
            })?;
            ctx.events.emit(
                EventKind::WorkflowStart,
                Some(self.id.as_str()),
                json!({ "workflow": workflow_name }),
            );

            for (index, node) in workflow.nodes.iter().enumerate() {
                let stage = format!("{workflow_name}.{}", node.name);
                let visits = self.visits.entry(node.name.clone()).or_insert(0);
                *visits += 1;
                let visit = *visits;
                if visit > node.max_visits {
                    return self.fail(
                        &stage,
                        format!("node exceeded max_visits ({})", node.max_visits),
                    );
                }

                let ticket = ctx.store.load(&self.id)?;
                let at = NodeLocation {
                    workflow_name: &workflow_name,
                    workflow,
                    node,
                    index,
                };
                ctx.events.emit(
                    EventKind::NodeStart,
                    Some(self.id.as_str()),
                    json!({ "workflow": workflow_name, "node": node.name, "visit": visit }),
                );
                let result = run_with_retries(
                    ctx.pipeline.max_retries,
                    |_| run_node(&ctx, &ticket, &self.artifacts, at),
                    |attempt, err| {
                        warn!(stage = %stage, attempt, error = %err, "node attempt failed, retrying");
                        ctx.events.emit(
                            EventKind::NodeRetry,
                            Some(self.id.as_str()),
                            json!({
                                "workflow": workflow_name,
                                "node": node.name,
                                "attempt": attempt,
                                "error": err.to_string(),
                            }),
                        );
                    },
                );

                let disposition = match result {
                    Err(err) => {
                        ctx.events.emit(
                            EventKind::NodeFail,
                            Some(self.id.as_str()),
                            json!({
                                "workflow": workflow_name,
                                "node": node.name,
                                "error": err.to_string(),
                            }),
                        );
                        return self.fail(&stage, err.to_string());
                    }
                    Ok(NodeResult::Success { output }) => {
                        ctx.events.emit(
                            EventKind::NodeComplete,
                            Some(self.id.as_str()),
                            json!({
                                "workflow": workflow_name,
                                "node": node.name,
                                "bytes": output.len(),
                            }),
                        );
                        continue;
                    }
                    Ok(NodeResult::Signal { disposition, .. }) => disposition,
                };
                ctx.events.emit(
                    EventKind::NodeComplete,
                    Some(self.id.as_str()),
                    json!({
                        "workflow": workflow_name,
                        "node": node.name,
                        "disposition": disposition.kind(),
                    }),
                );

                match disposition {
                    Disposition::Continue => {}
                    Disposition::Fail { reason } => {
                        let reason =
                            reason.unwrap_or_else(|| "decision node reported fail".to_string());
                        return self.fail(&stage, reason);
                    }
                    Disposition::Blocked { reason, block_on } => {
                        return self.block(&stage, reason, block_on);
                    }
                    Disposition::Decompose { subtasks, reason } => {
                        return self.decompose(&stage, &subtasks, reason);
                    }
                    Disposition::Route { workflow: target } => {
                        if !node.routes.contains(&target) {
                            return self.fail(
                                &stage,
                                format!("route to undeclared workflow '{target}'"),
                            );
                        }
                        info!(from = %workflow_name, to = %target, "routing");
                        ctx.events.emit(
                            EventKind::WorkflowComplete,
                            Some(self.id.as_str()),
                            json!({ "workflow": workflow_name, "routed_to": target }),
                        );
                        workflow_name = target;
                        continue 'workflows;
                    }
                }
            }

            return self.complete(&workflow_name, workflow);
        }
    }

    fn complete(&self, workflow_name: &str, workflow: &Workflow) -> Result<BuildOutcome, BuildError> {
        let ctx = self.ctx;
        let hook_ctx = self.hook_context()?;
        if let Err(failure) = run_hooks(
            ctx.hooks,
            HookPhase::Succeed,
            &ctx.pipeline.on_succeed,
            &hook_ctx,
            &ctx.paths.root,
            ctx.pipeline.hook_timeout(),
        ) {
            return self.fail_with(HookPhase::Succeed.as_str(), failure.to_string(), &hook_ctx);
        }

        let status = workflow.success_status();
        let mut ticket = ctx.store.load(&self.id)?;
        ticket.set_status(status.clone());
        if status == Status::Closed {
            ticket.push_note(format!("closed in build {}", self.artifacts.name()));
        } else {
            ticket.push_note(format!(
                "workflow {workflow_name} completed in build {}; status {status}",
                self.artifacts.name()
            ));
        }
        ctx.store.save(&ticket)?;
        ctx.events.emit(
            EventKind::WorkflowComplete,
            Some(self.id.as_str()),
            json!({ "workflow": workflow_name, "status": status }),
        );

        if status == Status::Closed {
            run_hooks_best_effort(
                ctx.hooks,
                HookPhase::Close,
                &ctx.pipeline.on_close,
                &hook_ctx,
                &ctx.paths.root,
                ctx.pipeline.hook_timeout(),
            );
        }
        Ok(BuildOutcome::Succeeded {
            workflow: workflow_name.to_string(),
            status,
        })
    }

    fn fail(&self, stage: &str, reason: String) -> Result<BuildOutcome, BuildError> {
        let hook_ctx = self.hook_context()?;
        self.fail_with(stage, reason, &hook_ctx)
    }

    fn fail_with(
        &self,
        stage: &str,
        reason: String,
        hook_ctx: &HookContext,
    ) -> Result<BuildOutcome, BuildError> {
        let ctx = self.ctx;
        let mut ticket = ctx.store.load(&self.id)?;
        ticket.set_status(Status::Blocked);
        ticket.push_note(format!(
            "build {} failed at {stage}: {reason}",
            self.artifacts.name()
        ));
        ctx.store.save(&ticket)?;
        warn!(ticket = %self.id, stage, reason = %reason, "build failed");
        run_hooks_best_effort(
            ctx.hooks,
            HookPhase::Fail,
            &ctx.pipeline.on_fail,
            hook_ctx,
            &ctx.paths.root,
            ctx.pipeline.hook_timeout(),
        );
        Ok(BuildOutcome::Failed {
            stage: stage.to_string(),
            reason,
        })
    }

    fn block(
        &self,
        stage: &str,
        reason: Option<String>,
        block_on: Option<String>,
    ) -> Result<BuildOutcome, BuildError> {
        let ctx = self.ctx;
        let reason = reason.unwrap_or_else(|| "decision node reported blocked".to_string());

        // block_on is only resolved here; a bad reference turns the outcome into a failure.
        let blocked_on = match block_on {
            None => None,
            Some(reference) => match ctx.store.resolve_id(&reference) {
                Ok(id) if id == self.id => {
                    return self.fail(stage, format!("ticket cannot block on itself ({reference})"));
                }
                Ok(id) => Some(id),
                Err(err) => {
                    return self.fail(
                        stage,
                        format!("cannot resolve block_on '{reference}': {err:#}"),
                    );
                }
            },
        };

        let mut ticket = ctx.store.load(&self.id)?;
        match &blocked_on {
            Some(dep) => {
                ticket.add_dep(dep);
                ticket.set_status(Status::Open);
                ticket.push_note(format!("blocked at {stage} on {dep}: {reason}"));
            }
            None => {
                // Blocked rather than open: with no dependency to gate it, an
                // open ticket would be picked straight back up by the loop.
                ticket.set_status(Status::Blocked);
                ticket.push_note(format!("blocked at {stage}: {reason}"));
            }
        }
        ctx.store.save(&ticket)?;
        info!(ticket = %self.id, stage, blocked_on = ?blocked_on, "build blocked");
        Ok(BuildOutcome::Blocked {
            stage: stage.to_string(),
            reason,
            blocked_on,
        })
    }

    fn decompose(
        &self,
        stage: &str,
        subtasks: &[String],
        reason: Option<String>,
    ) -> Result<BuildOutcome, BuildError> {
        let ctx = self.ctx;
        let parent = ctx.store.load(&self.id)?;
        let depth = parent.depth();
        let max_depth = ctx.pipeline.max_depth as usize;
        if depth >= max_depth {
            return self.fail(
                stage,
                format!("decomposition denied: depth {depth} reached max_depth {max_depth}"),
            );
        }

        let mut taken: HashSet<String> = ctx.store.list()?.into_iter().map(|t| t.id).collect();
        let mut children = Vec::with_capacity(subtasks.len());
        for subtask in subtasks {
            let mut id = parent.child_id(&generate_short_id());
            while taken.contains(&id) {
                id = parent.child_id(&generate_short_id());
            }
            taken.insert(id.clone());

            let (title, body) = split_subtask(subtask);
            let mut child = Ticket::new(id.clone(), title);
            child.body = body;
            child.priority = parent.priority;
            child.push_note(format!("created by decomposition of {}", parent.id));
            ctx.store.save(&child)?;
            children.push(id);
        }

        let mut parent = ctx.store.load(&self.id)?;
        for child in &children {
            parent.add_dep(child);
        }
        parent.set_status(Status::Open);
        let mut note = format!("decomposed into {}", children.join(", "));
        if let Some(reason) = reason {
            note.push_str(": ");
            note.push_str(&reason);
        }
        parent.push_note(note);
        ctx.store.save(&parent)?;
        info!(ticket = %self.id, children = children.len(), "build decomposed");
        Ok(BuildOutcome::Decomposed { children })
    }

    /// Diff the workspace against the pre-build snapshot and record the result.
    fn hook_context(&self) -> Result<HookContext, BuildError> {
        let after = WorkspaceSnapshot::capture(&self.ctx.paths.root);
        let changed_files = self.before.changed_files(&after);
        self.artifacts.write_changed_files(&changed_files)?;
        Ok(HookContext {
            ticket: self.id.clone(),
            changed_files,
            workspace: self.artifacts.workspace_dir.clone(),
            env: self.ctx.process_env(&self.id, Some(&self.artifacts)),
        })
    }
}

/// First line is the title; anything after it becomes the body.
fn split_subtask(subtask: &str) -> (String, String) {
    let trimmed = subtask.trim();
    match trimmed.split_once('\n') {
        Some((title, rest)) => (title.trim().to_string(), rest.trim().to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

/// Revert `in_progress` tickets left by a killed build to `open`.
///
/// Runs `on_fail` hooks best-effort for each recovered ticket and returns
/// the recovered ids.
#[instrument(skip(ctx))]
pub fn recover_interrupted(ctx: &BuildContext<'_>) -> anyhow::Result<Vec<String>> {
    let mut recovered = Vec::new();
    for ticket in ctx.store.list()? {
        if ticket.status != Status::InProgress {
            continue;
        }
        revert_interrupted(ctx, &ticket.id)?;
        let hook_ctx = HookContext {
            ticket: ticket.id.clone(),
            env: ctx.process_env(&ticket.id, None),
            ..HookContext::default()
        };
        run_hooks_best_effort(
            ctx.hooks,
            HookPhase::Fail,
            &ctx.pipeline.on_fail,
            &hook_ctx,
            &ctx.paths.root,
            ctx.pipeline.hook_timeout(),
        );
        recovered.push(ticket.id);
    }
    if !recovered.is_empty() {
        info!(count = recovered.len(), "recovered interrupted builds");
    }
    Ok(recovered)
}

/// Set one interrupted ticket back to `open` with an audit note.
pub fn revert_interrupted(ctx: &BuildContext<'_>, id: &str) -> anyhow::Result<Ticket> {
    let mut ticket = ctx.store.load(id)?;
    ticket.set_status(Status::Open);
    ticket.push_note("build interrupted; reopened by recovery");
    ctx.store.save(&ticket)?;
    warn!(ticket = %id, "reopened interrupted build");
    Ok(ticket)
}
