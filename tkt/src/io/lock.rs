//! Advisory single-instance lock for the loop (`.tkt/loop.lock`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another tkt loop holds {}", .0.display())]
    Held(PathBuf),
    #[error("open lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock released when dropped (or when the process dies).
#[derive(Debug)]
pub struct LoopLock {
    // NOTE(lifetime): held to keep the flock; released on drop
    _file: File,
    path: PathBuf,
}

impl LoopLock {
    /// Take the lock without blocking and record our pid in it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Open without truncating so a running holder's pid survives a failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        file.try_lock_exclusive()
            .map_err(|_| LockError::Held(path.to_path_buf()))?;
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        debug!(path = %path.display(), "acquired loop lock");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether some process currently holds the lock at `path`.
pub fn is_held(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    // Probe lock is dropped immediately, releasing it.
    file.try_lock_exclusive().is_err()
}
