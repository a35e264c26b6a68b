use std::fmt;

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

/// Separator between a parent id and a child's short id.
///
/// A ticket's decomposition depth is the number of separators in its id.
pub const ID_SEPARATOR: char = '.';

pub const DEFAULT_PRIORITY: u8 = 2;

const SHORT_ID_LEN: usize = 4;

/// Ticket lifecycle status.
///
/// Unrecognized strings are kept as [`Status::Unknown`] so a hand-edited
/// ticket still loads and can be reported instead of failing deserialization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Captured,
    Routed,
    Open,
    InProgress,
    Closed,
    Blocked,
    Unknown(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Captured => "captured",
            Status::Routed => "routed",
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Closed => "closed",
            Status::Blocked => "blocked",
            Status::Unknown(raw) => raw.as_str(),
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        let known = match value.as_str() {
            "captured" => Some(Status::Captured),
            "routed" => Some(Status::Routed),
            "open" => Some(Status::Open),
            "in_progress" => Some(Status::InProgress),
            "closed" => Some(Status::Closed),
            "blocked" => Some(Status::Blocked),
            _ => None,
        };
        known.unwrap_or_else(|| Status::Unknown(value))
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped free-text entry in a ticket's notes log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub status: Status,
    #[serde(default)]
    pub deps: Vec<String>,
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Ticket {
    /// Create an open ticket with default priority and no dependencies.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            status: Status::Open,
            deps: Vec::new(),
            priority: DEFAULT_PRIORITY,
            notes: Vec::new(),
            questions: Vec::new(),
            created: now,
            modified: now,
        }
    }

    /// Decomposition depth derived from the id structure.
    pub fn depth(&self) -> usize {
        depth_of(&self.id)
    }

    /// Id for a child of this ticket with the given short suffix.
    pub fn child_id(&self, short_id: &str) -> String {
        format!("{}{}{}", self.id, ID_SEPARATOR, short_id)
    }

    /// Add a dependency, keeping the set free of duplicates. Returns true if added.
    pub fn add_dep(&mut self, id: &str) -> bool {
        if self.deps.iter().any(|dep| dep == id) {
            return false;
        }
        self.deps.push(id.to_string());
        self.touch();
        true
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.touch();
    }

    pub fn push_note(&mut self, text: impl Into<String>) {
        self.notes.push(Note {
            at: Utc::now(),
            text: text.into(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }

    /// Most recent "closed in ..." audit note, if the ticket carries one.
    pub fn closed_audit(&self) -> Option<&str> {
        self.notes
            .iter()
            .rev()
            .map(|note| note.text.as_str())
            .find(|text| text.starts_with("closed in"))
    }
}

pub fn depth_of(id: &str) -> usize {
    id.matches(ID_SEPARATOR).count()
}

/// Random lowercase alphanumeric suffix for child ids.
pub fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(SHORT_ID_LEN)
        .collect::<String>()
        .to_lowercase()
}
