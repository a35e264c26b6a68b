//! File-backed ticket store under `.tkt/tickets/`.
//!
//! One pretty-printed JSON record per ticket. Writes go through a temp file and
//! a rename so a killed process never leaves a half-written ticket behind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::selector::open_dependencies;
use crate::ticket::Ticket;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ticket '{0}' not found")]
pub struct TicketNotFound(pub String);

/// Storage operations the build engine relies on.
///
/// Every call reads or writes the backing store; callers must not assume a
/// ticket loaded earlier is still current.
pub trait TicketStore {
    fn load(&self, id: &str) -> Result<Ticket>;
    fn save(&self, ticket: &Ticket) -> Result<()>;
    fn list(&self) -> Result<Vec<Ticket>>;

    /// Expand a full id or unique id prefix to the stored id.
    fn resolve_id(&self, partial: &str) -> Result<String> {
        let partial = partial.trim();
        if partial.is_empty() {
            return Err(anyhow!("empty ticket id"));
        }
        let ids: Vec<String> = self.list()?.into_iter().map(|t| t.id).collect();
        if ids.iter().any(|id| id == partial) {
            return Ok(partial.to_string());
        }
        let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(partial)).collect();
        match matches.as_slice() {
            [] => Err(TicketNotFound(partial.to_string()).into()),
            [only] => Ok((*only).clone()),
            many => Err(anyhow!(
                "ticket id '{partial}' is ambiguous: {}",
                many.iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    /// Reload, append a note, and persist.
    fn append_note(&self, id: &str, text: &str) -> Result<Ticket> {
        let mut ticket = self.load(id)?;
        ticket.push_note(text);
        self.save(&ticket)?;
        Ok(ticket)
    }

    /// Dependencies of `ticket` that are not closed (missing ids included).
    fn open_deps(&self, ticket: &Ticket) -> Result<Vec<String>> {
        let all = self.list()?;
        let index: HashMap<&str, &Ticket> = all.iter().map(|t| (t.id.as_str(), t)).collect();
        Ok(open_dependencies(ticket, &index))
    }

    fn deps_resolved(&self, ticket: &Ticket) -> Result<bool> {
        Ok(self.open_deps(ticket)?.is_empty())
    }
}

/// Tickets stored as `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileTicketStore {
    dir: PathBuf,
}

impl FileTicketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl TicketStore for FileTicketStore {
    fn load(&self, id: &str) -> Result<Ticket> {
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(TicketNotFound(id.to_string()).into());
        }
        read_ticket(&path)
    }

    fn save(&self, ticket: &Ticket) -> Result<()> {
        validate_id(&ticket.id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create ticket dir {}", self.dir.display()))?;
        let mut buf = serde_json::to_string_pretty(ticket).context("serialize ticket")?;
        buf.push('\n');
        write_atomic(&self.path_for(&ticket.id), &buf)?;
        debug!(ticket = %ticket.id, status = %ticket.status, "saved ticket");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Ticket>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut tickets = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read ticket dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_ticket(&path) {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable ticket"),
            }
        }
        tickets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tickets)
    }
}

fn read_ticket(path: &Path) -> Result<Ticket> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ticket {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse ticket {}", path.display()))
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.starts_with('.') {
        return Err(anyhow!("invalid ticket id '{id}'"));
    }
    Ok(())
}

/// Write via `<path>.tmp` then rename over the target.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Status;

    fn store() -> (tempfile::TempDir, FileTicketStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileTicketStore::new(temp.path().join("tickets"));
        (temp, store)
    }

    #[test]
    fn save_then_load() {
        let (_temp, store) = store();
        let mut ticket = Ticket::new("ab12", "Fix the thing");
        ticket.body = "details".to_string();
        store.save(&ticket).expect("save");
        assert_eq!(store.load("ab12").expect("load"), ticket);
        assert!(!store.dir.join("ab12.json.tmp").exists());
    }

    #[test]
    fn load_missing_is_typed_not_found() {
        let (_temp, store) = store();
        let err = store.load("nope").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TicketNotFound>(),
            Some(&TicketNotFound("nope".to_string()))
        );
    }

    #[test]
    fn resolve_id_accepts_unique_prefix() {
        let (_temp, store) = store();
        store.save(&Ticket::new("ab12", "a")).expect("save");
        store.save(&Ticket::new("ab12.x9k2", "child")).expect("save");
        store.save(&Ticket::new("cd34", "c")).expect("save");

        assert_eq!(store.resolve_id("ab12").expect("exact"), "ab12");
        assert_eq!(store.resolve_id("cd").expect("prefix"), "cd34");
        assert!(
            store
                .resolve_id("ab")
                .unwrap_err()
                .to_string()
                .contains("ambiguous")
        );
        assert!(store.resolve_id("zz").is_err());
    }

    #[test]
    fn append_note_persists() {
        let (_temp, store) = store();
        store.save(&Ticket::new("ab12", "a")).expect("save");
        store.append_note("ab12", "hello").expect("note");
        let loaded = store.load("ab12").expect("load");
        assert_eq!(loaded.notes.len(), 1);
        assert_eq!(loaded.notes[0].text, "hello");
    }

    #[test]
    fn open_deps_lists_unclosed_and_missing() {
        let (_temp, store) = store();
        let mut dep = Ticket::new("dep1", "dep");
        store.save(&dep).expect("save");
        let mut ticket = Ticket::new("main", "main");
        ticket.add_dep("dep1");
        ticket.add_dep("ghost");
        store.save(&ticket).expect("save");

        assert_eq!(
            store.open_deps(&ticket).expect("open deps"),
            vec!["dep1".to_string(), "ghost".to_string()]
        );

        dep.set_status(Status::Closed);
        store.save(&dep).expect("save");
        assert_eq!(
            store.open_deps(&ticket).expect("open deps"),
            vec!["ghost".to_string()]
        );
        ticket.deps.retain(|d| d != "ghost");
        assert!(store.deps_resolved(&ticket).expect("resolved"));
    }

    #[test]
    fn list_skips_unreadable_files() {
        let (_temp, store) = store();
        store.save(&Ticket::new("ab12", "a")).expect("save");
        fs::write(store.dir.join("broken.json"), "{").expect("write");
        let tickets = store.list().expect("list");
        assert_eq!(tickets.len(), 1);
    }
}
