//! Prompt assembly for agent-driven nodes.
//!
//! The template marks each section with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections go
//! first (skills, then prior context) and the largest remaining section is
//! truncated as a last resort.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::disposition::DISPOSITION_SCHEMA;
use crate::core::pipeline::Discretion;
use crate::error::ExecutionError;
use crate::ticket::Ticket;

const NODE_TEMPLATE: &str = include_str!("prompts/node.md");

/// Default prompt budget in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 200_000;

const DROP_ORDER: &[&str] = &["skills", "prior"];

#[derive(Debug, Clone, Serialize)]
struct TicketContext<'a> {
    id: &'a str,
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedText {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct PriorStep<'a> {
    node: &'a str,
    output: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct DecisionContext<'a> {
    schema: &'a str,
    routes: &'a [String],
}

/// Everything needed to render one node's prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub ticket: &'a Ticket,
    pub workflow: &'a str,
    pub node: &'a str,
    /// Prompt file or primary skill text.
    pub instructions: &'a str,
    pub skills: &'a [NamedText],
    /// `(node, output)` of earlier nodes in the same workflow.
    pub prior: &'a [(String, String)],
    /// Route targets when the node is a decision node.
    pub decision_routes: Option<&'a [String]>,
    pub discretion: Discretion,
}

/// Renders prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = render(input)?;
        let mut sections = parse_sections(&rendered)?;
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn render(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("node", NODE_TEMPLATE)
        .context("load node prompt template")?;
    let prior: Vec<PriorStep<'_>> = input
        .prior
        .iter()
        .map(|(node, output)| PriorStep {
            node,
            output: output.trim(),
        })
        .collect();
    let decision = input.decision_routes.map(|routes| DecisionContext {
        schema: DISPOSITION_SCHEMA,
        routes,
    });
    let template = env.get_template("node")?;
    let rendered = template
        .render(context! {
            ticket => TicketContext {
                id: &input.ticket.id,
                title: &input.ticket.title,
                body: input.ticket.body.trim(),
            },
            workflow => input.workflow,
            node => input.node,
            instructions => input.instructions.trim(),
            skills => input.skills,
            prior => prior,
            decision => decision,
            discretion => input.discretion.guidance(),
        })
        .context("render node prompt")?;
    Ok(rendered)
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Result<Vec<Section>> {
    let marker = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .map_err(|err| anyhow!("section marker regex: {err}"))?;
    let found: Vec<_> = marker.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in found.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = found
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    Ok(sections)
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    // The decision contract must survive intact or the output cannot be parsed.
    let Some(largest) = sections
        .iter_mut()
        .filter(|s| s.key != "decision")
        .max_by_key(|s| s.content.len())
    else {
        return;
    };
    let excess = total - budget;
    let keep = largest.content.len().saturating_sub(excess + 12);
    let mut cut = keep;
    while cut > 0 && !largest.content.is_char_boundary(cut) {
        cut -= 1;
    }
    let before_len = largest.content.len();
    largest.content.truncate(cut);
    largest.content.push_str("\n[truncated]");
    debug!(
        section = %largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
}

/// Read a prompt reference from `.tkt/prompts/<name>` or `<name>.md`.
pub fn load_prompt(prompts_dir: &Path, name: &str) -> Result<String, ExecutionError> {
    let candidates = [
        prompts_dir.join(name),
        prompts_dir.join(format!("{name}.md")),
    ];
    read_first(&candidates).ok_or_else(|| ExecutionError::MissingReference {
        kind: "prompt",
        name: name.to_string(),
    })
}

/// Read a skill from `.tkt/skills/<name>.md` or `.tkt/skills/<name>/SKILL.md`.
pub fn load_skill(skills_dir: &Path, name: &str) -> Result<String, ExecutionError> {
    let candidates = [
        skills_dir.join(format!("{name}.md")),
        skills_dir.join(name).join("SKILL.md"),
    ];
    read_first(&candidates).ok_or_else(|| ExecutionError::MissingReference {
        kind: "skill",
        name: name.to_string(),
    })
}

fn read_first(candidates: &[PathBuf]) -> Option<String> {
    candidates
        .iter()
        .filter(|path| path.is_file())
        .find_map(|path| fs::read_to_string(path).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> Ticket {
        let mut t = Ticket::new("ab12", "Add login");
        t.body = "Users need to log in.".to_string();
        t
    }

    fn inputs<'a>(
        ticket: &'a Ticket,
        skills: &'a [NamedText],
        prior: &'a [(String, String)],
        routes: Option<&'a [String]>,
    ) -> PromptInputs<'a> {
        PromptInputs {
            ticket,
            workflow: "feature",
            node: "implement",
            instructions: "Write the code.",
            skills,
            prior,
            decision_routes: routes,
            discretion: Discretion::Low,
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let ticket = ticket();
        let skills = vec![NamedText {
            name: "rust".to_string(),
            text: "Prefer iterators.".to_string(),
        }];
        let prior = vec![("plan".to_string(), "Step one.".to_string())];
        let routes = vec!["feature".to_string()];
        let prompt = PromptBuilder::default()
            .build(&inputs(&ticket, &skills, &prior, Some(&routes)))
            .expect("build");

        let order = [
            "## Ticket ab12: Add login",
            "## Instructions",
            "## Skills",
            "## Prior Context",
            "## Decision Output",
            "## Discretion",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|h| prompt.find(h).unwrap_or_else(|| panic!("missing {h}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.contains("Users need to log in."));
        assert!(prompt.contains("Step one."));
        assert!(prompt.contains("`feature`"));
        assert!(prompt.contains(Discretion::Low.guidance()));
    }

    #[test]
    fn action_nodes_get_no_decision_block() {
        let ticket = ticket();
        let prompt = PromptBuilder::default()
            .build(&inputs(&ticket, &[], &[], None))
            .expect("build");
        assert!(!prompt.contains("## Decision Output"));
        assert!(!prompt.contains("## Prior Context"));
        assert!(!prompt.contains("<!-- section"));
    }

    #[test]
    fn budget_drops_skills_then_prior_context() {
        let ticket = ticket();
        let skills = vec![NamedText {
            name: "big".to_string(),
            text: "skill ".repeat(200),
        }];
        let prior = vec![("plan".to_string(), "prior ".repeat(200))];

        let prompt = PromptBuilder::new(2_000)
            .build(&inputs(&ticket, &skills, &prior, None))
            .expect("build");
        assert!(!prompt.contains("## Skills"));
        assert!(prompt.contains("## Prior Context"));

        let prompt = PromptBuilder::new(600)
            .build(&inputs(&ticket, &skills, &prior, None))
            .expect("build");
        assert!(!prompt.contains("## Prior Context"));
        assert!(prompt.contains("## Instructions"));
    }

    #[test]
    fn truncation_keeps_the_decision_contract() {
        let mut ticket = ticket();
        ticket.body = "x".repeat(10_000);
        let routes = vec!["feature".to_string()];
        let prompt = PromptBuilder::new(4_000)
            .build(&inputs(&ticket, &[], &[], Some(&routes)))
            .expect("build");
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.contains("\"disposition\""));
    }

    #[test]
    fn references_resolve_with_or_without_extension() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prompts = temp.path().join("prompts");
        let skills = temp.path().join("skills");
        fs::create_dir_all(prompts.join("x")).expect("mkdir");
        fs::create_dir_all(skills.join("deploy")).expect("mkdir");
        fs::write(prompts.join("triage.md"), "triage text").expect("write");
        fs::write(skills.join("deploy/SKILL.md"), "deploy text").expect("write");

        assert_eq!(load_prompt(&prompts, "triage").expect("prompt"), "triage text");
        assert_eq!(
            load_prompt(&prompts, "triage.md").expect("prompt"),
            "triage text"
        );
        assert_eq!(load_skill(&skills, "deploy").expect("skill"), "deploy text");
        assert!(matches!(
            load_prompt(&prompts, "missing"),
            Err(ExecutionError::MissingReference { kind: "prompt", .. })
        ));
    }
}
