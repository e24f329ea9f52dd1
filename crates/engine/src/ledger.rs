//! Rename-based transactions around risky file operations.
//!
//! A [`BackupLedger`] moves files out of the way to `_<name>.bak` siblings
//! before an external tool touches them, then either deletes the backups
//! ([`BackupLedger::commit`]), restores them ([`BackupLedger::rollback`]) or
//! hands them over as retained originals ([`BackupLedger::keep`]). All three
//! consume the ledger, so a ledger resolves exactly once.

use std::path::{Path, PathBuf};
use log::{debug, error, warn};
use tokio::task::JoinSet;
use crate::error::LedgerError;

/// A file temporarily renamed out of the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub current_path: PathBuf,
    pub original_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// No backups taken yet
    Clean,
    /// At least one file has been moved aside
    BackedUp,
    /// Backups deleted (or deliberately retained)
    Committed,
    /// Backups restored to their original paths
    RolledBack,
}

/// Sibling path a file is moved to while it is being replaced
pub fn backup_path(path: &Path) -> Result<PathBuf, LedgerError> {
    let name = path
        .file_name()
        .ok_or_else(|| LedgerError::NoFileName(path.to_path_buf()))?;
    let mut backup_name = std::ffi::OsString::from("_");
    backup_name.push(name);
    backup_name.push(".bak");
    Ok(path.with_file_name(backup_name))
}

/// Per-task list of backups, owned by exactly one task
#[derive(Debug)]
pub struct BackupLedger {
    records: Vec<BackupRecord>,
    state: LedgerState,
}

impl Default for BackupLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupLedger {
    pub fn new() -> Self {
        BackupLedger {
            records: Vec::new(),
            state: LedgerState::Clean,
        }
    }

    pub fn state(&self) -> LedgerState {
        self.state
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    /// Rename `path` to its backup sibling and record the pair
    pub async fn begin_backup(&mut self, path: &Path) -> Result<BackupRecord, LedgerError> {
        if matches!(self.state, LedgerState::Committed | LedgerState::RolledBack) {
            return Err(LedgerError::Resolved);
        }

        let backup = backup_path(path)?;
        tokio::fs::rename(path, &backup)
            .await
            .map_err(|source| LedgerError::Backup {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Backed up {} -> {}", path.display(), backup.display());

        let record = BackupRecord {
            current_path: backup,
            original_path: path.to_path_buf(),
        };
        self.records.push(record.clone());
        self.state = LedgerState::BackedUp;
        Ok(record)
    }

    /// Delete every backup. All deletes are attempted even if some fail.
    pub async fn commit(mut self) -> Result<(), LedgerError> {
        self.state = LedgerState::Committed;
        let records = std::mem::take(&mut self.records);
        let total = records.len();

        let mut set = JoinSet::new();
        for record in records {
            set.spawn(async move {
                let result = tokio::fs::remove_file(&record.current_path).await;
                (record, result)
            });
        }

        let failed = collect_failures(&mut set, "delete").await;
        if failed > 0 {
            return Err(LedgerError::Incomplete {
                action: "deleted",
                failed,
                total,
            });
        }
        Ok(())
    }

    /// Restore every backup to its original path, concurrently and best-effort
    pub async fn rollback(mut self) -> Result<(), LedgerError> {
        self.state = LedgerState::RolledBack;
        let records = std::mem::take(&mut self.records);
        let total = records.len();

        let mut set = JoinSet::new();
        for record in records {
            set.spawn(async move {
                let result = tokio::fs::rename(&record.current_path, &record.original_path).await;
                (record, result)
            });
        }

        let failed = collect_failures(&mut set, "restore").await;
        if failed > 0 {
            return Err(LedgerError::Incomplete {
                action: "restored",
                failed,
                total,
            });
        }
        Ok(())
    }

    /// End the transaction leaving backups on disk as retained originals
    pub fn keep(mut self) -> Vec<BackupRecord> {
        self.state = LedgerState::Committed;
        std::mem::take(&mut self.records)
    }
}

async fn collect_failures(
    set: &mut JoinSet<(BackupRecord, std::io::Result<()>)>,
    action: &str,
) -> usize {
    let mut failed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((record, Err(e))) => {
                failed += 1;
                warn!(
                    "Failed to {} backup {} (original {}): {}",
                    action,
                    record.current_path.display(),
                    record.original_path.display(),
                    e
                );
            }
            Err(e) => {
                failed += 1;
                warn!("Backup {} task did not complete: {}", action, e);
            }
        }
    }
    failed
}

impl Drop for BackupLedger {
    fn drop(&mut self) {
        if self.state == LedgerState::BackedUp {
            error!(
                "Backup ledger dropped with {} unresolved backup(s): {:?}",
                self.records.len(),
                self.records.iter().map(|r| &r.current_path).collect::<Vec<_>>()
            );
        }
    }
}
