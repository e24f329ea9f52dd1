use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the rename-based backup ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("failed to back up {path}: {source}")]
    Backup { path: PathBuf, source: io::Error },

    #[error("ledger is already resolved, no further backups can be recorded")]
    Resolved,

    #[error("{failed} of {total} backup(s) could not be {action}")]
    Incomplete {
        action: &'static str,
        failed: usize,
        total: usize,
    },
}

/// Failures talking to the remote store
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },

    #[error("remote command `{command}` failed (exit code {code}): {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Failures choosing a remote destination
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no candidate roots configured")]
    NoRoots,

    #[error("no storage pool reported for root {0}")]
    NoMatchingPool(PathBuf),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Missing external tools, detected before any task runs
#[derive(Debug, Error)]
#[error("required tool `{tool}` was not found: {source}")]
pub struct ToolNotFound {
    pub tool: PathBuf,
    pub source: which::Error,
}

/// Aggregate outcome of a batch with at least one failed task
#[derive(Debug, Error)]
#[error("{failed} of {total} task(s) failed")]
pub struct BatchFailed {
    pub failed: usize,
    pub total: usize,
}

/// Malformed SubRip input
#[derive(Debug, Error)]
pub enum SrtError {
    #[error("line {line}: expected a cue timing, found `{text}`")]
    Timing { line: usize, text: String },

    #[error("line {line}: invalid timestamp `{text}`")]
    Timestamp { line: usize, text: String },
}
