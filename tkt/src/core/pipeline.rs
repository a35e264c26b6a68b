//! Declarative pipeline model: workflows, nodes, and setting inheritance.
//!
//! Settings that can be overridden (model, allow-all, allowed tools) resolve
//! most-specific-first: node, then workflow, then pipeline. `None` at a level
//! falls through; `Some(vec![])` for allowed tools is an explicit override.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::de::value::{MapAccessDeserializer, SeqAccessDeserializer};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::duration;
use crate::core::invariants::validate_workflows;
use crate::ticket::Status;

/// Entry workflow every build starts in.
pub const MAIN_WORKFLOW: &str = "main";
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    /// Harness name used to invoke the agent.
    #[serde(default = "default_agent", alias = "command")]
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub discretion: Discretion,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub step_timeout: Option<Duration>,
    #[serde(default)]
    pub allow_all_tool_calls: Option<bool>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Extra system prompt handed to harnesses that support one.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub on_succeed: Vec<String>,
    #[serde(default)]
    pub on_fail: Vec<String>,
    #[serde(default)]
    pub on_close: Vec<String>,
    #[serde(default)]
    pub workflows: BTreeMap<String, Workflow>,
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_depth() -> u32 {
    3
}

impl PipelineSpec {
    /// Pipeline with default settings and the given workflows.
    pub fn with_workflows(workflows: BTreeMap<String, Workflow>) -> Self {
        Self {
            agent: default_agent(),
            model: None,
            max_retries: default_max_retries(),
            max_depth: default_max_depth(),
            discretion: Discretion::default(),
            step_timeout: None,
            allow_all_tool_calls: None,
            allowed_tools: None,
            system_prompt: None,
            on_succeed: Vec::new(),
            on_fail: Vec::new(),
            on_close: Vec::new(),
            workflows,
        }
    }

    /// Reject structurally invalid workflow graphs.
    pub fn validate(&self) -> Result<()> {
        let errors = validate_workflows(&self.workflows);
        if !errors.is_empty() {
            bail!("invalid pipeline:\n- {}", errors.join("\n- "));
        }
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// Effective settings for one node of one workflow.
    pub fn settings_for(&self, workflow: &Workflow, node: &NodeSpec) -> NodeSettings {
        NodeSettings {
            model: resolve(
                self.model.as_ref(),
                workflow.model.as_ref(),
                node.model.as_ref(),
            ),
            allow_all: resolve(
                self.allow_all_tool_calls.as_ref(),
                workflow.allow_all_tool_calls.as_ref(),
                node.allow_all_tool_calls.as_ref(),
            )
            .unwrap_or(false),
            allowed_tools: resolve(
                self.allowed_tools.as_ref(),
                workflow.allowed_tools.as_ref(),
                node.allowed_tools.as_ref(),
            ),
            timeout: node
                .timeout
                .or(self.step_timeout)
                .unwrap_or(DEFAULT_STEP_TIMEOUT),
        }
    }

    /// Timeout applied to hooks (pipeline step timeout or the default).
    pub fn hook_timeout(&self) -> Duration {
        self.step_timeout.unwrap_or(DEFAULT_STEP_TIMEOUT)
    }
}

/// First value that is set, checking the node, then the workflow, then the pipeline.
pub fn resolve<T: Clone>(pipeline: Option<&T>, workflow: Option<&T>, node: Option<&T>) -> Option<T> {
    node.or(workflow).or(pipeline).cloned()
}

/// Settings after three-level inheritance has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub model: Option<String>,
    pub allow_all: bool,
    /// `None` means no restriction was configured at any level.
    pub allowed_tools: Option<Vec<String>>,
    pub timeout: Duration,
}

/// How much latitude the agent is told it has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discretion {
    Low,
    #[default]
    Medium,
    High,
}

impl Discretion {
    pub fn guidance(self) -> &'static str {
        match self {
            Discretion::Low => {
                "Follow the instructions literally. Do not make changes outside the stated scope; if something is unclear, stop and report it instead of guessing."
            }
            Discretion::Medium => {
                "Use reasonable judgment on details the instructions do not cover, but stay within the ticket's scope and note any assumptions you make."
            }
            Discretion::High => {
                "You have broad latitude. Make the decisions needed to finish the ticket well, including small adjacent fixes, and summarize what you decided."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub nodes: Vec<NodeSpec>,
    pub model: Option<String>,
    pub allow_all_tool_calls: Option<bool>,
    pub allowed_tools: Option<Vec<String>>,
    /// Status applied when the workflow completes (defaults to closed).
    pub on_success: Option<Status>,
}

impl Workflow {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self {
            nodes,
            model: None,
            allow_all_tool_calls: None,
            allowed_tools: None,
            on_success: None,
        }
    }

    pub fn success_status(&self) -> Status {
        self.on_success.clone().unwrap_or(Status::Closed)
    }
}

/// On disk a workflow is either a bare node list or a table with overrides.
/// The shape is picked from the value itself so errors inside it surface as-is.
impl<'de> Deserialize<'de> for Workflow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(WorkflowVisitor)
    }
}

struct WorkflowVisitor;

impl<'de> Visitor<'de> for WorkflowVisitor {
    type Value = Workflow;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of nodes or a table with `nodes`")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> std::result::Result<Workflow, A::Error> {
        let nodes = Vec::<NodeSpec>::deserialize(SeqAccessDeserializer::new(seq))?;
        Ok(Workflow::new(nodes))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> std::result::Result<Workflow, A::Error> {
        let table = WorkflowTable::deserialize(MapAccessDeserializer::new(map))?;
        Ok(table.into())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowTable {
    nodes: Vec<NodeSpec>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    allow_all_tool_calls: Option<bool>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    on_success: Option<Status>,
}

impl From<WorkflowTable> for Workflow {
    fn from(table: WorkflowTable) -> Self {
        Workflow {
            nodes: table.nodes,
            model: table.model,
            allow_all_tool_calls: table.allow_all_tool_calls,
            allowed_tools: table.allowed_tools,
            on_success: table.on_success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum NodeKind {
    Decision,
    Action,
    Unknown(String),
}

impl From<String> for NodeKind {
    fn from(value: String) -> Self {
        let known = match value.as_str() {
            "decision" => Some(NodeKind::Decision),
            "action" => Some(NodeKind::Action),
            _ => None,
        };
        known.unwrap_or_else(|| NodeKind::Unknown(value))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Decision => f.write_str("decision"),
            NodeKind::Action => f.write_str("action"),
            NodeKind::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Unique across the whole pipeline.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allow_all_tool_calls: Option<bool>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default = "default_max_visits")]
    pub max_visits: u32,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub skills: Vec<String>,
}

fn default_max_visits() -> u32 {
    1
}

/// What a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTask<'a> {
    Prompt(&'a str),
    Run(&'a str),
    Skill(&'a str),
}

impl NodeSpec {
    fn bare(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            prompt: None,
            run: None,
            skill: None,
            model: None,
            allow_all_tool_calls: None,
            allowed_tools: None,
            routes: Vec::new(),
            max_visits: default_max_visits(),
            timeout: None,
            skills: Vec::new(),
        }
    }

    /// Decision node driven by a prompt reference.
    pub fn decision(name: &str, prompt: &str, routes: &[&str]) -> Self {
        Self {
            prompt: Some(prompt.to_string()),
            routes: routes.iter().map(|r| r.to_string()).collect(),
            ..Self::bare(name, NodeKind::Decision)
        }
    }

    /// Action node driven by a prompt reference.
    pub fn action(name: &str, prompt: &str) -> Self {
        Self {
            prompt: Some(prompt.to_string()),
            ..Self::bare(name, NodeKind::Action)
        }
    }

    /// Action node running a shell command.
    pub fn shell(name: &str, command: &str) -> Self {
        Self {
            run: Some(command.to_string()),
            ..Self::bare(name, NodeKind::Action)
        }
    }

    pub fn is_decision(&self) -> bool {
        self.kind == NodeKind::Decision
    }

    /// The node's single task, or `None` unless exactly one of prompt/run/skill is set.
    pub fn task(&self) -> Option<NodeTask<'_>> {
        match (&self.prompt, &self.run, &self.skill) {
            (Some(prompt), None, None) => Some(NodeTask::Prompt(prompt)),
            (None, Some(run), None) => Some(NodeTask::Run(run)),
            (None, None, Some(skill)) => Some(NodeTask::Skill(skill)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> PipelineSpec {
        toml::from_str(raw).expect("parse pipeline")
    }

    #[test]
    fn parses_both_workflow_shapes() {
        let spec = parse(
            r#"
agent = "codex"
step_timeout = "10m"

[[workflows.main]]
name = "triage"
type = "decision"
prompt = "triage.md"
routes = ["feature"]

[workflows.feature]
model = "opus"
on_success = "routed"

[[workflows.feature.nodes]]
name = "implement"
type = "action"
prompt = "implement.md"
timeout = "30m"
"#,
        );
        assert_eq!(spec.agent, "codex");
        assert_eq!(spec.step_timeout, Some(Duration::from_secs(600)));
        let main = spec.workflow("main").expect("main");
        assert_eq!(main.nodes[0].kind, NodeKind::Decision);
        assert_eq!(main.nodes[0].max_visits, 1);
        let feature = spec.workflow("feature").expect("feature");
        assert_eq!(feature.model.as_deref(), Some("opus"));
        assert_eq!(feature.success_status(), Status::Routed);
        assert_eq!(
            feature.nodes[0].timeout,
            Some(Duration::from_secs(30 * 60))
        );
    }

    #[test]
    fn errors_inside_a_workflow_name_the_field() {
        let list = toml::from_str::<PipelineSpec>(
            r#"
[[workflows.main]]
name = "triage"
type = "decision"
promt = "triage"
"#,
        )
        .expect_err("typo in node");
        assert!(list.to_string().contains("unknown field `promt`"), "{list}");

        let table = toml::from_str::<PipelineSpec>(
            r#"
[workflows.main]
nodes = [{ name = "verify", type = "action", run = "true" }]
on_sucess = "routed"
"#,
        )
        .expect_err("typo in table");
        assert!(table.to_string().contains("unknown field `on_sucess`"), "{table}");
    }

    #[test]
    fn command_is_an_alias_for_agent() {
        let spec = parse("command = \"gemini\"\n");
        assert_eq!(spec.agent, "gemini");
        assert_eq!(spec.max_retries, 2);
        assert_eq!(spec.discretion, Discretion::Medium);
    }

    #[test]
    fn unknown_node_type_parses_for_validation() {
        let spec = parse(
            r#"
[[workflows.main]]
name = "n"
type = "gate"
run = "true"
"#,
        );
        assert_eq!(
            spec.workflows["main"].nodes[0].kind,
            NodeKind::Unknown("gate".to_string())
        );
        assert!(spec.validate().is_err());
    }

    #[test]
    fn resolve_prefers_most_specific_level() {
        let p = "pipeline".to_string();
        let w = "workflow".to_string();
        let n = "node".to_string();
        assert_eq!(resolve(Some(&p), Some(&w), Some(&n)), Some(n.clone()));
        assert_eq!(resolve(Some(&p), Some(&w), None), Some(w.clone()));
        assert_eq!(resolve(Some(&p), None, None), Some(p.clone()));
        assert_eq!(resolve::<String>(None, None, None), None);
    }

    #[test]
    fn explicit_empty_tool_list_overrides_pipeline() {
        let mut node = NodeSpec::action("implement", "implement.md");
        node.allowed_tools = Some(Vec::new());
        let workflow = Workflow::new(vec![node.clone()]);
        let mut spec = PipelineSpec::with_workflows(BTreeMap::new());
        spec.allowed_tools = Some(vec!["Read".to_string()]);
        spec.allow_all_tool_calls = Some(true);

        let settings = spec.settings_for(&workflow, &node);
        assert_eq!(settings.allowed_tools, Some(Vec::new()));
        assert!(settings.allow_all);
        assert_eq!(settings.timeout, DEFAULT_STEP_TIMEOUT);

        let unset = NodeSpec::action("review", "review.md");
        let settings = spec.settings_for(&workflow, &unset);
        assert_eq!(settings.allowed_tools, Some(vec!["Read".to_string()]));
    }

    #[test]
    fn node_timeout_beats_step_timeout() {
        let mut node = NodeSpec::shell("verify", "true");
        node.timeout = Some(Duration::from_secs(5));
        let workflow = Workflow::new(vec![node.clone()]);
        let mut spec = PipelineSpec::with_workflows(BTreeMap::new());
        spec.step_timeout = Some(Duration::from_secs(60));
        assert_eq!(
            spec.settings_for(&workflow, &node).timeout,
            Duration::from_secs(5)
        );
        let plain = NodeSpec::shell("lint", "true");
        assert_eq!(
            spec.settings_for(&workflow, &plain).timeout,
            Duration::from_secs(60)
        );
    }
}
