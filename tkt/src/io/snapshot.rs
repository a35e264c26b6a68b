//! Pre/post workspace snapshots used to compute a build's changed files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

/// Directories never included in a snapshot.
const SKIPPED_DIRS: &[&str] = &[".git", ".tkt", "target", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// Size and mtime of every regular file under a root, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    files: BTreeMap<String, FileStamp>,
}

impl WorkspaceSnapshot {
    /// Walk `root`. Unreadable entries are skipped.
    pub fn capture(root: &Path) -> Self {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_skipped(entry))
            .filter_map(|entry| entry.ok());
        for entry in walker {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            files.insert(
                relative.to_string_lossy().replace('\\', "/"),
                FileStamp {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            );
        }
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sorted paths added, removed, or modified between `self` and `after`.
    pub fn changed_files(&self, after: &WorkspaceSnapshot) -> Vec<String> {
        let mut changed: Vec<String> = after
            .files
            .iter()
            .filter(|(path, stamp)| self.files.get(*path) != Some(*stamp))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            self.files
                .keys()
                .filter(|path| !after.files.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}
