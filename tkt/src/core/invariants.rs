//! Structural invariants of the workflow graph.

use std::collections::{BTreeMap, HashMap};

use crate::core::pipeline::{MAIN_WORKFLOW, NodeKind, Workflow};

/// Check the workflow graph and return every violation found:
/// - at least one workflow, including `main`
/// - every workflow has nodes
/// - node names unique across all workflows
/// - exactly one of `prompt`/`run`/`skill` per node
/// - `type` is `decision` or `action`
/// - `routes` only on decision nodes, each naming a declared workflow
/// - `max_visits >= 1`
pub fn validate_workflows(workflows: &BTreeMap<String, Workflow>) -> Vec<String> {
    let mut errors = Vec::new();
    if workflows.is_empty() {
        errors.push("no workflows defined".to_string());
        return errors;
    }
    if !workflows.contains_key(MAIN_WORKFLOW) {
        errors.push(format!("missing required workflow '{MAIN_WORKFLOW}'"));
    }

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (workflow_name, workflow) in workflows {
        if workflow.nodes.is_empty() {
            errors.push(format!("workflow '{workflow_name}' has no nodes"));
        }
        for node in &workflow.nodes {
            let at = format!("{workflow_name}.{}", node.name);
            if node.name.trim().is_empty() {
                errors.push(format!("workflow '{workflow_name}': node name must be non-empty"));
            }
            if let Some(first) = owners.insert(node.name.as_str(), workflow_name.as_str()) {
                errors.push(format!(
                    "duplicate node name '{}' (in '{first}' and '{workflow_name}')",
                    node.name
                ));
            }

            let tasks = [&node.prompt, &node.run, &node.skill]
                .iter()
                .filter(|t| t.is_some())
                .count();
            if tasks != 1 {
                errors.push(format!(
                    "{at}: exactly one of prompt, run, skill is required (found {tasks})"
                ));
            }

            match &node.kind {
                NodeKind::Decision => {}
                NodeKind::Action => {
                    if !node.routes.is_empty() {
                        errors.push(format!("{at}: routes are only allowed on decision nodes"));
                    }
                }
                NodeKind::Unknown(raw) => {
                    errors.push(format!(
                        "{at}: type must be 'decision' or 'action', got '{raw}'"
                    ));
                }
            }

            for target in &node.routes {
                if !workflows.contains_key(target) {
                    errors.push(format!(
                        "{at}: route target '{target}' is not a declared workflow"
                    ));
                }
            }

            if node.max_visits == 0 {
                errors.push(format!("{at}: max_visits must be >= 1"));
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::NodeSpec;

    fn graph(entries: Vec<(&str, Vec<NodeSpec>)>) -> BTreeMap<String, Workflow> {
        entries
            .into_iter()
            .map(|(name, nodes)| (name.to_string(), Workflow::new(nodes)))
            .collect()
    }

    fn valid_graph() -> BTreeMap<String, Workflow> {
        graph(vec![
            (
                "main",
                vec![NodeSpec::decision("triage", "triage.md", &["feature"])],
            ),
            (
                "feature",
                vec![
                    NodeSpec::action("implement", "implement.md"),
                    NodeSpec::shell("verify", "cargo test"),
                ],
            ),
        ])
    }

    #[test]
    fn valid_graph_has_no_errors() {
        assert!(validate_workflows(&valid_graph()).is_empty());
    }

    #[test]
    fn empty_graph_is_rejected() {
        let errors = validate_workflows(&BTreeMap::new());
        assert_eq!(errors, vec!["no workflows defined".to_string()]);
    }

    #[test]
    fn main_workflow_is_required() {
        let errors = validate_workflows(&graph(vec![(
            "feature",
            vec![NodeSpec::shell("verify", "true")],
        )]));
        assert!(errors.iter().any(|e| e.contains("missing required workflow 'main'")));
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let mut workflows = valid_graph();
        workflows.insert("docs".to_string(), Workflow::new(Vec::new()));
        let errors = validate_workflows(&workflows);
        assert!(errors.iter().any(|e| e.contains("workflow 'docs' has no nodes")));
    }

    #[test]
    fn node_names_must_be_unique_across_workflows() {
        let mut workflows = valid_graph();
        workflows
            .get_mut("feature")
            .expect("feature")
            .nodes
            .push(NodeSpec::shell("triage", "true"));
        let errors = validate_workflows(&workflows);
        assert!(errors.iter().any(|e| e.contains("duplicate node name 'triage'")));
    }

    #[test]
    fn exactly_one_task_per_node() {
        let mut both = NodeSpec::action("implement", "implement.md");
        both.run = Some("make".to_string());
        let mut neither = NodeSpec::action("review", "review.md");
        neither.prompt = None;
        let errors = validate_workflows(&graph(vec![("main", vec![both, neither])]));
        assert!(errors.iter().any(|e| e.contains("main.implement") && e.contains("found 2")));
        assert!(errors.iter().any(|e| e.contains("main.review") && e.contains("found 0")));
    }

    #[test]
    fn routes_only_on_decision_nodes_and_must_exist() {
        let mut action = NodeSpec::action("implement", "implement.md");
        action.routes = vec!["main".to_string()];
        let decision = NodeSpec::decision("triage", "triage.md", &["nowhere"]);
        let errors = validate_workflows(&graph(vec![("main", vec![decision, action])]));
        assert!(errors.iter().any(|e| e.contains("routes are only allowed on decision nodes")));
        assert!(errors.iter().any(|e| e.contains("route target 'nowhere'")));
    }

    #[test]
    fn max_visits_must_be_positive() {
        let mut node = NodeSpec::shell("verify", "true");
        node.max_visits = 0;
        let errors = validate_workflows(&graph(vec![("main", vec![node])]));
        assert!(errors.iter().any(|e| e.contains("max_visits must be >= 1")));
    }
}
