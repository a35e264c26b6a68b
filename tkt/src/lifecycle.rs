//! Background loop lifecycle: `tkt start`, `tkt stop`, `tkt status`.
//!
//! The advisory lock is the authority on whether a loop runs; the pid file
//! only records which process group to signal and can go stale after an
//! unclean shutdown.

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::BuildContext;
use crate::core::duration::format_duration;
use crate::core::limits::LoopLimits;
use crate::io::init::ProjectPaths;
use crate::io::lock::is_held;
use crate::io::process::{descendant_pids, process_alive, signal_group};
use crate::io::ticket_store::write_atomic;
use crate::looping::StopFile;
use crate::orchestrator::recover_interrupted;

const TERM_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
    pub log_path: PathBuf,
}

/// Re-execute this binary as a detached `tkt loop` in its own process group.
#[instrument(skip_all)]
pub fn start_background(paths: &ProjectPaths, limits: &LoopLimits) -> Result<Started> {
    if !paths.is_provisioned() {
        bail!(
            "{} not found (run `tkt init` first)",
            paths.pipeline_path.display()
        );
    }
    if is_held(&paths.lock_path) {
        bail!("a loop is already running (lock held)");
    }
    if let Some(pid) = read_pid(&paths.pid_path)?
        && process_alive(pid)
    {
        bail!("a loop is already running (pid {pid})");
    }

    let exe = std::env::current_exe().context("locate tkt executable")?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)
        .with_context(|| format!("open {}", paths.log_path.display()))?;
    let log_err = log.try_clone().context("clone log handle")?;

    let mut cmd = Command::new(exe);
    cmd.arg("loop")
        .args(loop_args(limits))
        .current_dir(&paths.root)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0);
    let child = cmd.spawn().context("spawn background loop")?;
    let pid = child.id();
    write_atomic(&paths.pid_path, &format!("{pid}\n"))?;
    info!(pid, "background loop started");
    Ok(Started {
        pid,
        log_path: paths.log_path.clone(),
    })
}

fn loop_args(limits: &LoopLimits) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(max) = limits.max_tickets {
        args.push("--max-tickets".to_string());
        args.push(max.to_string());
    }
    if let Some(max) = limits.max_duration {
        args.push("--max-duration".to_string());
        args.push(format_duration(max));
    }
    args
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Process group that was signalled, if a live pid was recorded.
    pub signalled: Option<u32>,
    /// Only a stop request was written; the loop exits after its current build.
    pub graceful: bool,
    /// Tickets reverted from `in_progress` to `open`.
    pub recovered: Vec<String>,
    /// The lock was still held after the kill sequence, so recovery was skipped.
    pub lock_held: bool,
}

/// Stop the background loop.
///
/// Without `graceful`, the loop and every process group below it get TERM,
/// then KILL after a grace period, and interrupted tickets are reopened. The
/// recorded pid is only signalled while the loop lock is held.
#[instrument(skip(ctx))]
pub fn stop_background(ctx: &BuildContext<'_>, graceful: bool) -> Result<StopOutcome> {
    let paths = ctx.paths;
    if graceful {
        StopFile::new(&paths.stop_path).request()?;
        info!("stop requested");
        return Ok(StopOutcome {
            graceful: true,
            ..StopOutcome::default()
        });
    }

    let mut outcome = StopOutcome::default();
    if let Some(pid) = read_pid(&paths.pid_path)? {
        // A free lock means no loop runs and the pid may have been reused.
        if is_held(&paths.lock_path) && process_alive(pid) {
            terminate_group(pid, &paths.lock_path);
            outcome.signalled = Some(pid);
        } else {
            debug!(pid, "pid file is stale; not signalling");
        }
    }
    remove_pid_file(&paths.pid_path)?;

    if is_held(&paths.lock_path) {
        warn!("loop lock still held; skipping recovery");
        outcome.lock_held = true;
        return Ok(outcome);
    }
    outcome.recovered = recover_interrupted(ctx)?;
    Ok(outcome)
}

/// Agents, shell nodes, and hooks lead their own process groups, so each
/// descendant group is signalled along with the loop's.
fn signal_tree(pid: u32, descendants: &[u32], signal: &str) {
    signal_group(pid, signal);
    for child in descendants {
        signal_group(*child, signal);
    }
}

fn terminate_group(pid: u32, lock_path: &Path) {
    let descendants = descendant_pids(pid);
    signal_tree(pid, &descendants, "-TERM");
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if !process_alive(pid) && !is_held(lock_path) {
            debug!(pid, "loop exited after TERM");
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    warn!(pid, "loop ignored TERM; sending KILL");
    let mut descendants = descendants;
    descendants.extend(descendant_pids(pid));
    signal_tree(pid, &descendants, "-KILL");
    thread::sleep(POLL_INTERVAL);
}

fn remove_pid_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Recorded pid, or `None` when the file is missing or unreadable as a pid.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    match raw.trim().parse() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => {
            warn!(path = %path.display(), "ignoring malformed pid file");
            Ok(None)
        }
    }
}

/// Derived loop status; nothing here is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub provisioned: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub last_log_line: Option<String>,
}

pub fn loop_status(paths: &ProjectPaths) -> Result<LoopStatus> {
    let pid = read_pid(&paths.pid_path)?;
    let running = match pid {
        Some(pid) => process_alive(pid),
        None => is_held(&paths.lock_path),
    };
    Ok(LoopStatus {
        provisioned: paths.is_provisioned(),
        running,
        pid,
        last_log_line: last_line(&paths.log_path),
    })
}

fn last_line(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    String::from_utf8_lossy(&bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
