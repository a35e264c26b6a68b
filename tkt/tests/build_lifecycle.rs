//! End-to-end builds against a temporary project with a scripted agent.
//!
//! Shell nodes and the workspace snapshot use the real filesystem and `sh`;
//! agent output comes from `ScriptedExecutor`.

use tkt::core::selector::EligibilityError;
use tkt::core::types::BuildOutcome;
use tkt::error::BuildError;
use tkt::io::init::SAMPLE_PIPELINE;
use tkt::orchestrator::{build_ticket, recover_interrupted};
use tkt::test_support::{RecordingHookRunner, TestProject};
use tkt::ticket::Status;

const SINGLE_DECISION: &str = r#"
max_retries = 0
max_depth = 2

[[workflows.main]]
name = "plan"
type = "decision"
prompt = "triage"
routes = ["feature"]

[[workflows.feature]]
name = "implement"
type = "action"
prompt = "implement"
"#;

fn event_names(project: &TestProject, id: &str) -> Vec<String> {
    project
        .events
        .read(Some(id))
        .expect("read events")
        .into_iter()
        .map(|record| record.event)
        .collect()
}

#[test]
fn route_runs_the_target_workflow_and_closes_the_ticket() {
    let project = TestProject::new(SAMPLE_PIPELINE);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "route", "workflow": "feature"}"#);
    project.executor.push_ok("implemented login");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert_eq!(
        outcome,
        BuildOutcome::Succeeded {
            workflow: "feature".to_string(),
            status: Status::Closed,
        }
    );
    let ticket = project.ticket("ab12");
    assert_eq!(ticket.status, Status::Closed);
    assert!(ticket.closed_audit().is_some());

    let prompts = project.executor.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("## Decision Output"));
    assert!(prompts[1].contains("step `implement` of workflow `feature`"));
    assert!(!prompts[1].contains("## Decision Output"));

    let events = event_names(&project, "ab12");
    assert_eq!(events.first().map(String::as_str), Some("workflow_start"));
    assert_eq!(events.last().map(String::as_str), Some("build_complete"));
    assert_eq!(
        events.iter().filter(|e| *e == "node_complete").count(),
        3,
        "triage, implement, verify"
    );
}

#[test]
fn build_artifacts_hold_snapshot_and_node_outputs() {
    let project = TestProject::new(SAMPLE_PIPELINE);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "route", "workflow": "feature"}"#);
    project.executor.push_ok("implemented login");
    build_ticket(&project.context(), "ab12").expect("build");

    let ticket_builds = project.paths.builds_dir.join("ab12");
    let build_dir = std::fs::read_dir(&ticket_builds)
        .expect("builds dir")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .next()
        .expect("one build");
    assert!(build_dir.join("ticket.json").is_file());
    assert!(build_dir.join("main.triage.out").is_file());
    assert!(build_dir.join("feature.verify.out").is_file());
    assert!(build_dir.join("changed-files.txt").is_file());
    let workspace = std::fs::read_to_string(build_dir.join("workspace/feature.implement"))
        .expect("workspace output");
    assert_eq!(workspace, "implemented login");
}

#[test]
fn earlier_action_output_reaches_later_prompts() {
    let project = TestProject::new(
        r#"
[[workflows.main]]
name = "design"
type = "action"
prompt = "implement"

[[workflows.main]]
name = "build"
type = "action"
prompt = "implement"
"#,
    );
    project.add_ticket("ab12", "Add login");
    project.executor.push_ok("use session cookies");
    project.executor.push_ok("done");

    build_ticket(&project.context(), "ab12").expect("build");

    let prompts = project.executor.prompts();
    assert!(!prompts[0].contains("## Prior Context"));
    assert!(prompts[1].contains("## Prior Context"));
    assert!(prompts[1].contains("use session cookies"));
}

#[test]
fn decompose_creates_children_and_gates_the_parent() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket_with("ab12", Status::Open, 1, &[]);
    project.executor.push_decision(
        r#"{"disposition": "decompose", "subtasks": ["Write schema\nColumns: id, email", "Add endpoint"]}"#,
    );

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Decomposed { children } = outcome else {
        panic!("expected decomposed, got {outcome:?}");
    };
    assert_eq!(children.len(), 2);
    let parent = project.ticket("ab12");
    assert_eq!(parent.status, Status::Open);
    for id in &children {
        assert!(id.starts_with("ab12."));
        assert!(parent.deps.contains(id));
        let child = project.ticket(id);
        assert_eq!(child.status, Status::Open);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.priority, 1);
    }
    let first = project.ticket(&children[0]);
    assert_eq!(first.title, "Write schema");
    assert_eq!(first.body, "Columns: id, email");
}

#[test]
fn decompose_at_max_depth_is_denied() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12.cd34.ef56", "Too deep");
    project
        .executor
        .push_decision(r#"{"disposition": "decompose", "subtasks": ["a"]}"#);

    let outcome = build_ticket(&project.context(), "ab12.cd34.ef56").expect("build");

    assert!(matches!(outcome, BuildOutcome::Failed { .. }));
    let ticket = project.ticket("ab12.cd34.ef56");
    assert_eq!(ticket.status, Status::Blocked);
    assert!(ticket.deps.is_empty());
    let note = &ticket.notes.last().expect("note").text;
    assert!(note.contains("decomposition denied"), "{note}");
}

#[test]
fn fail_disposition_blocks_with_stage_note() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "fail", "reason": "spec is contradictory"}"#);

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert_eq!(
        outcome,
        BuildOutcome::Failed {
            stage: "main.plan".to_string(),
            reason: "spec is contradictory".to_string(),
        }
    );
    let ticket = project.ticket("ab12");
    assert_eq!(ticket.status, Status::Blocked);
    let note = &ticket.notes.last().expect("note").text;
    assert!(note.contains("main.plan") && note.contains("spec is contradictory"));
}

#[test]
fn blocked_on_another_ticket_adds_a_dependency() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12", "Add login");
    project.add_ticket("zz99", "Set up auth provider");
    project.executor.push_decision(
        r#"{"disposition": "blocked", "reason": "needs provider", "block_on": "zz"}"#,
    );

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert_eq!(
        outcome,
        BuildOutcome::Blocked {
            stage: "main.plan".to_string(),
            reason: "needs provider".to_string(),
            blocked_on: Some("zz99".to_string()),
        }
    );
    let ticket = project.ticket("ab12");
    assert_eq!(ticket.status, Status::Open);
    assert_eq!(ticket.deps, vec!["zz99".to_string()]);
}

#[test]
fn unresolvable_block_on_degrades_to_failure() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "blocked", "block_on": "nope"}"#);

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { reason, .. } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert!(reason.contains("nope"));
    assert_eq!(project.ticket("ab12").status, Status::Blocked);
}

#[test]
fn blocked_without_reference_parks_the_ticket() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "blocked", "reason": "waiting on design"}"#);

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert!(matches!(outcome, BuildOutcome::Blocked { blocked_on: None, .. }));
    assert_eq!(project.ticket("ab12").status, Status::Blocked);
}

#[test]
fn route_outside_declared_targets_fails() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket("ab12", "Add login");
    project
        .executor
        .push_decision(r#"{"disposition": "route", "workflow": "main"}"#);

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert_eq!(stage, "main.plan");
    assert!(reason.contains("undeclared"));
}

#[test]
fn max_visits_breaks_routing_cycles() {
    let project = TestProject::new(
        r#"
[[workflows.main]]
name = "triage"
type = "decision"
prompt = "triage"
routes = ["main"]
max_visits = 2
"#,
    );
    project.add_ticket("ab12", "Loops forever");
    for _ in 0..2 {
        project
            .executor
            .push_decision(r#"{"disposition": "route", "workflow": "main"}"#);
    }

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert_eq!(stage, "main.triage");
    assert!(reason.contains("max_visits"));
    assert_eq!(project.executor.remaining(), 0);
    assert_eq!(project.executor.prompts().len(), 2);
}

#[test]
fn crashes_are_retried_until_success() {
    let project = TestProject::new(
        r#"
max_retries = 2

[[workflows.main]]
name = "work"
type = "action"
prompt = "implement"
"#,
    );
    project.add_ticket("ab12", "Flaky agent");
    project.executor.push_crash("segfault");
    project.executor.push_crash("segfault again");
    project.executor.push_ok("finally");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert!(outcome.is_success());
    let retries = event_names(&project, "ab12")
        .into_iter()
        .filter(|e| e == "node_retry")
        .count();
    assert_eq!(retries, 2);
}

#[test]
fn malformed_decision_output_is_retried() {
    let project = TestProject::new(
        r#"
max_retries = 1

[[workflows.main]]
name = "plan"
type = "decision"
prompt = "triage"
"#,
    );
    project.add_ticket("ab12", "Chatty agent");
    project.executor.push_ok("I think we should continue.");
    project
        .executor
        .push_decision(r#"{"disposition": "continue"}"#);

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert!(outcome.is_success());
    assert_eq!(project.ticket("ab12").status, Status::Closed);
}

#[test]
fn exhausted_retries_fail_and_run_on_fail_hooks() {
    let project = TestProject::new(
        r#"
max_retries = 1
on_fail = ["notify {{ ticket }}"]

[[workflows.main]]
name = "work"
type = "action"
prompt = "implement"
"#,
    );
    project.add_ticket("ab12", "Broken agent");
    project.executor.push_crash("boom");
    project.executor.push_crash("boom");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert_eq!(stage, "main.work");
    assert!(reason.contains("exited with status 1"), "{reason}");
    assert_eq!(project.ticket("ab12").status, Status::Blocked);
    assert_eq!(project.hooks.commands(), vec!["notify ab12".to_string()]);
}

#[test]
fn failing_shell_node_fails_the_build() {
    let project = TestProject::new(
        r#"
max_retries = 0

[[workflows.main]]
name = "check"
type = "action"
run = "echo nope >&2; exit 3"
"#,
    );
    project.add_ticket("ab12", "Red build");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { reason, .. } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert!(reason.contains("status 3"));
    assert!(reason.contains("nope"));
}

#[test]
fn on_succeed_hooks_see_changed_files_then_on_close_runs() {
    let project = TestProject::new(
        r#"
on_succeed = ["check {{ changed_files }}"]
on_close = ["announce {{ ticket }}"]

[[workflows.main]]
name = "write"
type = "action"
run = "echo hi > out.txt"
"#,
    );
    project.add_ticket("ab12", "Write a file");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert!(outcome.is_success());
    assert_eq!(
        project.hooks.commands(),
        vec!["check out.txt".to_string(), "announce ab12".to_string()]
    );
}

#[test]
fn on_succeed_hook_failure_turns_success_into_failure() {
    let project = TestProject::with_hooks(
        r#"
on_succeed = ["lint {{ ticket }}", "never runs"]
on_close = ["announce {{ ticket }}"]

[[workflows.main]]
name = "check"
type = "action"
run = "true"
"#,
        RecordingHookRunner::failing_on("lint"),
    );
    project.add_ticket("ab12", "Lint fails");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    let BuildOutcome::Failed { stage, .. } = outcome else {
        panic!("expected failed, got {outcome:?}");
    };
    assert_eq!(stage, "on_succeed");
    assert_eq!(project.ticket("ab12").status, Status::Blocked);
    assert_eq!(project.hooks.commands(), vec!["lint ab12".to_string()]);
}

#[test]
fn workflow_success_status_can_leave_the_ticket_open() {
    let project = TestProject::new(
        r#"
[workflows.main]
on_success = "routed"
nodes = [{ name = "sort", type = "action", run = "true" }]
"#,
    );
    project.add_ticket("ab12", "Needs a human look");

    let outcome = build_ticket(&project.context(), "ab12").expect("build");

    assert_eq!(
        outcome,
        BuildOutcome::Succeeded {
            workflow: "main".to_string(),
            status: Status::Routed,
        }
    );
    assert!(project.ticket("ab12").closed_audit().is_none());
}

#[test]
fn ineligible_tickets_are_refused_before_building() {
    let project = TestProject::new(SINGLE_DECISION);
    project.add_ticket_with("busy", Status::InProgress, 2, &[]);
    project.add_ticket_with("gated", Status::Open, 2, &["busy"]);
    project.add_ticket_with("parked", Status::Captured, 2, &[]);
    let ctx = project.context();

    assert!(matches!(
        build_ticket(&ctx, "busy"),
        Err(BuildError::Ineligible(EligibilityError::AlreadyRunning { .. }))
    ));
    assert!(matches!(
        build_ticket(&ctx, "gated"),
        Err(BuildError::Ineligible(EligibilityError::DependenciesOpen { .. }))
    ));
    assert!(matches!(
        build_ticket(&ctx, "parked"),
        Err(BuildError::Ineligible(EligibilityError::NotEligible { .. }))
    ));
    assert!(project.executor.prompts().is_empty());
    assert_eq!(project.ticket("gated").status, Status::Open);
}

#[test]
fn closed_ticket_refusal_echoes_the_audit_note() {
    let project = TestProject::new(
        r#"
[[workflows.main]]
name = "check"
type = "action"
run = "true"
"#,
    );
    project.add_ticket("ab12", "Once");
    build_ticket(&project.context(), "ab12").expect("first build");

    let err = build_ticket(&project.context(), "ab12").expect_err("second build");
    let message = err.to_string();
    assert!(message.contains("already closed"), "{message}");
    assert!(message.contains("closed in build"), "{message}");
}

#[test]
fn recovery_reopens_interrupted_tickets() {
    let project = TestProject::new(
        r#"
on_fail = ["cleanup {{ ticket }}"]

[[workflows.main]]
name = "check"
type = "action"
run = "true"
"#,
    );
    project.add_ticket_with("killed", Status::InProgress, 2, &[]);
    project.add_ticket_with("fine", Status::Open, 2, &[]);

    let recovered = recover_interrupted(&project.context()).expect("recover");

    assert_eq!(recovered, vec!["killed".to_string()]);
    let ticket = project.ticket("killed");
    assert_eq!(ticket.status, Status::Open);
    assert!(ticket.notes.last().expect("note").text.contains("interrupted"));
    assert_eq!(project.hooks.commands(), vec!["cleanup killed".to_string()]);
}
