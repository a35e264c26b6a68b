//! Decision-node output: locating and validating the disposition record.
//!
//! A decision node must end its output with a fenced JSON block. The last
//! fully closed block wins; an unterminated trailing fence is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON Schema for the disposition record. Also shown to agents verbatim.
pub const DISPOSITION_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "type": "object",
  "required": ["disposition"],
  "properties": {
    "disposition": { "enum": ["continue", "fail", "blocked", "decompose", "route"] },
    "reason": { "type": "string" },
    "block_on": { "type": "string" },
    "workflow": { "type": "string", "minLength": 1 },
    "subtasks": { "type": "array", "items": { "type": "string", "minLength": 1 } }
  },
  "allOf": [
    {
      "if": { "required": ["disposition"], "properties": { "disposition": { "const": "route" } } },
      "then": { "required": ["workflow"] }
    },
    {
      "if": { "required": ["disposition"], "properties": { "disposition": { "const": "decompose" } } },
      "then": { "required": ["subtasks"], "properties": { "subtasks": { "minItems": 1 } } }
    }
  ]
}"#;

/// Structured outcome selected by a decision node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Continue,
    Fail {
        #[serde(default)]
        reason: Option<String>,
    },
    Blocked {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        block_on: Option<String>,
    },
    Decompose {
        subtasks: Vec<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Route {
        workflow: String,
    },
}

impl Disposition {
    pub fn kind(&self) -> &'static str {
        match self {
            Disposition::Continue => "continue",
            Disposition::Fail { .. } => "fail",
            Disposition::Blocked { .. } => "blocked",
            Disposition::Decompose { .. } => "decompose",
            Disposition::Route { .. } => "route",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispositionError {
    #[error("no fenced ```json block found in decision output")]
    NotFound,
    #[error("disposition block is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("disposition does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("disposition schema failed to compile: {0}")]
    BadSchema(String),
}

/// Content of the last fully closed fenced block.
///
/// An opener is a bare fence or a `json`-tagged fence; the closer is a bare fence.
pub fn extract_fenced_block(text: &str) -> Option<String> {
    let mut last: Option<String> = None;
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match current.take() {
            None => {
                if trimmed == "```" || trimmed == "```json" {
                    current = Some(Vec::new());
                }
            }
            Some(mut body) => {
                if trimmed == "```" {
                    last = Some(body.join("\n"));
                } else {
                    body.push(line);
                    current = Some(body);
                }
            }
        }
    }

    last
}

/// Extract, schema-check, and decode the disposition from raw decision output.
pub fn parse_disposition(text: &str) -> Result<Disposition, DispositionError> {
    let block = extract_fenced_block(text).ok_or(DispositionError::NotFound)?;
    let value: Value = serde_json::from_str(block.trim())
        .map_err(|err| DispositionError::InvalidJson(err.to_string()))?;
    validate_against_schema(&value)?;
    serde_json::from_value(value).map_err(|err| DispositionError::Schema(vec![err.to_string()]))
}

fn validate_against_schema(value: &Value) -> Result<(), DispositionError> {
    let schema: Value = serde_json::from_str(DISPOSITION_SCHEMA)
        .map_err(|err| DispositionError::BadSchema(err.to_string()))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| DispositionError::BadSchema(err.to_string()))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(DispositionError::Schema(messages));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_returns_last_closed_block() {
        let text = "thinking...\n```json\n{\"a\": 1}\n```\nmore\n```\n{\"b\": 2}\n```\n";
        assert_eq!(extract_fenced_block(text).as_deref(), Some("{\"b\": 2}"));
    }

    #[test]
    fn extract_ignores_trailing_unclosed_fence() {
        let text = "```json\n{\"a\": 1}\n```\n```json\n{\"partial\": ";
        assert_eq!(extract_fenced_block(text).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn extract_returns_none_without_fence() {
        assert_eq!(extract_fenced_block("just some prose\nno fences here"), None);
        assert_eq!(extract_fenced_block("```json\n{\"open\": true}"), None);
    }

    #[test]
    fn extract_skips_other_language_openers() {
        let text = "```rust\nfn main() {}\n```\n";
        // A `rust` opener is not a disposition fence; its closer opens a new block that never closes.
        assert_eq!(extract_fenced_block(text), None);
    }

    #[test]
    fn parses_each_disposition_type() {
        let cases = [
            ("{\"disposition\":\"continue\"}", Disposition::Continue),
            (
                "{\"disposition\":\"fail\",\"reason\":\"tests red\"}",
                Disposition::Fail {
                    reason: Some("tests red".to_string()),
                },
            ),
            (
                "{\"disposition\":\"blocked\",\"block_on\":\"ab12\"}",
                Disposition::Blocked {
                    reason: None,
                    block_on: Some("ab12".to_string()),
                },
            ),
            (
                "{\"disposition\":\"decompose\",\"subtasks\":[\"a\",\"b\"]}",
                Disposition::Decompose {
                    subtasks: vec!["a".to_string(), "b".to_string()],
                    reason: None,
                },
            ),
            (
                "{\"disposition\":\"route\",\"workflow\":\"feature\"}",
                Disposition::Route {
                    workflow: "feature".to_string(),
                },
            ),
        ];
        for (json, expected) in cases {
            let text = format!("Decision below.\n```json\n{json}\n```\n");
            assert_eq!(parse_disposition(&text).expect(json), expected);
        }
    }

    #[test]
    fn rejects_unknown_or_missing_type() {
        let unknown = "```json\n{\"disposition\":\"escalate\"}\n```";
        assert!(matches!(
            parse_disposition(unknown),
            Err(DispositionError::Schema(_))
        ));
        let missing = "```json\n{\"reason\":\"x\"}\n```";
        assert!(matches!(
            parse_disposition(missing),
            Err(DispositionError::Schema(_))
        ));
    }

    #[test]
    fn rejects_route_without_workflow() {
        let text = "```json\n{\"disposition\":\"route\"}\n```";
        assert!(matches!(
            parse_disposition(text),
            Err(DispositionError::Schema(_))
        ));
    }

    #[test]
    fn rejects_decompose_without_subtasks() {
        let text = "```json\n{\"disposition\":\"decompose\",\"subtasks\":[]}\n```";
        assert!(matches!(
            parse_disposition(text),
            Err(DispositionError::Schema(_))
        ));
    }

    #[test]
    fn reports_invalid_json_and_missing_block() {
        assert_eq!(
            parse_disposition("no block"),
            Err(DispositionError::NotFound)
        );
        assert!(matches!(
            parse_disposition("```json\n{not json}\n```"),
            Err(DispositionError::InvalidJson(_))
        ));
    }
}
