//! Units of work driven by the scheduler.
//!
//! Every task wraps one external tool (or one in-memory transform) behind the
//! same lifecycle: the scheduler attaches a tracker and optionally an output
//! sink, then calls [`Task::run`] exactly once.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::config::{EngineConfig, Ownership};
use crate::progress::{spawn_poller, BufferedSource, PollOptions, ProgressPattern, ProgressReading};
use crate::tool::{OutputSink, ToolCommand, ToolOutput};
use crate::tracker::Tracker;

pub mod merge;
pub mod subtitle_clean;
pub mod sync;
pub mod track_clean;
pub mod transfer;

pub use merge::MergeTask;
pub use subtitle_clean::SubtitleCleanTask;
pub use sync::SyncTask;
pub use track_clean::TrackCleanTask;
pub use transfer::TransferTask;

/// Extra facts a task reports about its run (the scheduler adds `duration`)
pub type Characteristics = BTreeMap<String, String>;

/// What every task gets from the batch it runs in
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(config: Arc<EngineConfig>, cancel: CancellationToken) -> Self {
        TaskContext { config, cancel }
    }

    /// Fail fast if the batch was cancelled
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("cancelled");
        }
        Ok(())
    }
}

/// One unit of orchestrated work
#[async_trait]
pub trait Task: Send {
    /// Name shown in progress bars and the final report
    fn display_name(&self) -> &str;

    fn attach_tracker(&mut self, tracker: Tracker);

    /// Receive a copy of the external tool's stdout
    fn attach_output(&mut self, sink: OutputSink);

    async fn run(&mut self, ctx: &TaskContext) -> Result<Characteristics>;
}

/// Spawn `command`, feed its progress into `tracker` and wait for it.
///
/// Returns the tool output together with the last progress reading seen.
/// Without a tracker the tool simply runs with no poller attached.
pub(crate) async fn run_with_progress(
    command: &ToolCommand,
    pattern: ProgressPattern,
    options: PollOptions,
    tracker: Option<&Tracker>,
    sink: Option<OutputSink>,
) -> Result<(ToolOutput, Option<ProgressReading>)> {
    let running = command.spawn(sink)?;
    let source = BufferedSource::new(running.output(), pattern);
    let poller = spawn_poller(tracker, source, options);

    let outcome = running.wait().await;
    let last = match poller {
        Some(poller) => poller.finish().await,
        None => None,
    };
    Ok((outcome?, last))
}

/// Apply configured owner and mode to a local file
#[cfg(unix)]
pub(crate) fn apply_local_ownership(path: &Path, owner: Option<Ownership>, mode: Option<u32>) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(owner) = owner {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
    }
    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn apply_local_ownership(_path: &Path, _owner: Option<Ownership>, _mode: Option<u32>) -> std::io::Result<()> {
    Ok(())
}

/// Short name for a path used in display names
pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let ctx = TaskContext::new(Arc::new(EngineConfig::default()), CancellationToken::new());
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        assert_eq!(ctx.checkpoint().unwrap_err().to_string(), "cancelled");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_progress_updates_tracker() {
        let tracker = Tracker::new();
        tracker.start();
        let command = ToolCommand::new("sh").arg("-c").arg("printf 'Progress: 30%%\\r'; sleep 0.05; printf 'Progress: 80%%\\r'");
        let (_, last) = run_with_progress(
            &command,
            ProgressPattern::merge(),
            PollOptions::every(std::time::Duration::from_millis(10)),
            Some(&tracker),
            None,
        )
        .await
        .unwrap();
        assert_eq!(last.map(|r| r.percent), Some(80));
        assert_eq!(tracker.value(), 80);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_progress_without_tracker() {
        let command = ToolCommand::new("sh").arg("-c").arg("printf 'Progress: 50%%\\r'");
        let (output, last) = run_with_progress(
            &command,
            ProgressPattern::merge(),
            PollOptions::every(std::time::Duration::from_millis(10)),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert!(last.is_none());
    }
}
