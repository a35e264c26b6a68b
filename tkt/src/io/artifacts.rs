//! Per-build artifact directories under `.tkt/builds/<id>/<timestamp>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ticket::Ticket;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    pub dir: PathBuf,
    pub ticket_path: PathBuf,
    pub changed_files_path: PathBuf,
    pub workspace_dir: PathBuf,
}

impl BuildArtifacts {
    /// Paths for a build of `ticket_id` started at `started`. Nothing is created.
    pub fn new(builds_dir: &Path, ticket_id: &str, started: DateTime<Utc>) -> Self {
        let dir = builds_dir
            .join(ticket_id)
            .join(started.format(STAMP_FORMAT).to_string());
        Self::at(dir)
    }

    fn at(dir: PathBuf) -> Self {
        Self {
            ticket_path: dir.join("ticket.json"),
            changed_files_path: dir.join("changed-files.txt"),
            workspace_dir: dir.join("workspace"),
            dir,
        }
    }

    /// Create the directory tree and snapshot the ticket into it.
    ///
    /// Two builds of one ticket within the same second get `_1`, `_2`, ... suffixes.
    pub fn create(
        builds_dir: &Path,
        ticket: &Ticket,
        started: DateTime<Utc>,
    ) -> Result<Self> {
        let mut artifacts = Self::new(builds_dir, &ticket.id, started);
        let base = artifacts.dir.clone();
        let mut suffix = 1;
        while artifacts.dir.exists() {
            let mut name = base.as_os_str().to_owned();
            name.push(format!("_{suffix}"));
            artifacts = Self::at(PathBuf::from(name));
            suffix += 1;
        }
        fs::create_dir_all(&artifacts.workspace_dir).with_context(|| {
            format!("create build dir {}", artifacts.workspace_dir.display())
        })?;
        write_json(&artifacts.ticket_path, ticket)?;
        Ok(artifacts)
    }

    /// Directory name, used in audit notes (`closed in build <name>`).
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn node_output_path(&self, workflow: &str, node: &str) -> PathBuf {
        self.dir.join(format!("{workflow}.{node}.out"))
    }

    /// Prompt handed to file-reading harnesses for one node.
    pub fn prompt_path(&self, workflow: &str, node: &str) -> PathBuf {
        self.dir.join(format!("{workflow}.{node}.prompt"))
    }

    pub fn workspace_path(&self, workflow: &str, node: &str) -> PathBuf {
        self.workspace_dir.join(format!("{workflow}.{node}"))
    }

    /// Raw output of one node attempt, overwritten by later attempts.
    pub fn write_node_output(&self, workflow: &str, node: &str, output: &str) -> Result<()> {
        write_text(&self.node_output_path(workflow, node), output)
    }

    /// Output handed to later nodes of the same workflow.
    pub fn write_workspace(&self, workflow: &str, node: &str, output: &str) -> Result<()> {
        write_text(&self.workspace_path(workflow, node), output)
    }

    /// Workspace outputs of `earlier` nodes in `workflow`, in order. Missing files are skipped.
    pub fn prior_outputs(&self, workflow: &str, earlier: &[&str]) -> Vec<(String, String)> {
        earlier
            .iter()
            .filter_map(|node| {
                fs::read_to_string(self.workspace_path(workflow, node))
                    .ok()
                    .map(|text| ((*node).to_string(), text))
            })
            .collect()
    }

    pub fn write_changed_files(&self, files: &[String]) -> Result<()> {
        let mut buf = files.join("\n");
        if !buf.is_empty() {
            buf.push('\n');
        }
        write_text(&self.changed_files_path, &buf)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("valid time")
    }

    #[test]
    fn build_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = BuildArtifacts::new(temp.path(), "ab12", started());
        assert!(artifacts.dir.ends_with("ab12/20260304_050607"));
        assert!(artifacts.ticket_path.ends_with("ticket.json"));
        assert!(
            artifacts
                .workspace_path("main", "triage")
                .ends_with("workspace/main.triage")
        );
        assert!(
            artifacts
                .node_output_path("main", "triage")
                .ends_with("main.triage.out")
        );
        assert_eq!(artifacts.name(), "20260304_050607");
    }

    #[test]
    fn create_snapshots_ticket_and_avoids_collisions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ticket = Ticket::new("ab12", "Title");
        let first = BuildArtifacts::create(temp.path(), &ticket, started()).expect("create");
        let second = BuildArtifacts::create(temp.path(), &ticket, started()).expect("create");

        assert!(first.ticket_path.is_file());
        assert!(first.workspace_dir.is_dir());
        assert_ne!(first.dir, second.dir);
        assert_eq!(second.name(), "20260304_050607_1");
    }

    #[test]
    fn prior_outputs_follow_requested_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ticket = Ticket::new("ab12", "Title");
        let artifacts = BuildArtifacts::create(temp.path(), &ticket, started()).expect("create");
        artifacts
            .write_workspace("feature", "plan", "the plan")
            .expect("write");
        artifacts
            .write_workspace("feature", "implement", "the diff")
            .expect("write");
        artifacts
            .write_workspace("main", "triage", "other workflow")
            .expect("write");

        let prior = artifacts.prior_outputs("feature", &["plan", "implement", "missing"]);
        assert_eq!(
            prior,
            vec![
                ("plan".to_string(), "the plan".to_string()),
                ("implement".to_string(), "the diff".to_string())
            ]
        );
    }

    #[test]
    fn changed_files_list_is_newline_terminated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ticket = Ticket::new("ab12", "Title");
        let artifacts = BuildArtifacts::create(temp.path(), &ticket, started()).expect("create");
        artifacts
            .write_changed_files(&["a.rs".to_string(), "b.rs".to_string()])
            .expect("write");
        assert_eq!(
            fs::read_to_string(&artifacts.changed_files_path).expect("read"),
            "a.rs\nb.rs\n"
        );
    }
}
