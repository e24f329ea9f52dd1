use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use humansize::{format_size, BINARY};
use log::{debug, info};
use crate::error::RemoteError;
use crate::progress::{PollOptions, ProgressPattern};
use crate::remote::RemoteTransport;
use crate::tool::{OutputSink, ToolCommand};
use crate::tracker::Tracker;
use super::{file_label, run_with_progress, Characteristics, Task, TaskContext};

/// Upload one local file into a remote directory with rsync.
///
/// Progress is clamped to 2..=99 while the copy runs; the ends of the bar
/// belong to directory preparation and ownership fix-up.
pub struct TransferTask {
    local_path: PathBuf,
    remote_dir: PathBuf,
    transport: Arc<dyn RemoteTransport>,
    display_name: String,
    tracker: Option<Tracker>,
    output: Option<OutputSink>,
}

impl TransferTask {
    pub fn new(local_path: impl Into<PathBuf>, remote_dir: impl Into<PathBuf>, transport: Arc<dyn RemoteTransport>) -> Self {
        let local_path = local_path.into();
        let display_name = file_label(&local_path);
        TransferTask {
            local_path,
            remote_dir: remote_dir.into(),
            transport,
            display_name,
            tracker: None,
            output: None,
        }
    }

    pub fn remote_path(&self) -> PathBuf {
        self.remote_dir.join(file_label(&self.local_path))
    }

    fn command(&self, rsync: &Path, ssh: &Path) -> ToolCommand {
        let mut destination = self.remote_dir.to_string_lossy().into_owned();
        if !destination.ends_with('/') {
            destination.push('/');
        }
        ToolCommand::new(rsync)
            .args(["--partial", "--append-verify", "--info=progress2", "-s"])
            .arg("-e")
            .arg(ssh)
            .arg(&self.local_path)
            .arg(format!("{}:{}", self.transport.host(), destination))
    }

    fn set_value(&self, value: u8) {
        if let Some(tracker) = &self.tracker {
            tracker.set_value(value);
        }
    }

    /// Apply configured owner and mode to the remote directory and file
    async fn finalize(&self, ctx: &TaskContext, remote_path: &Path) -> Result<(), RemoteError> {
        let transport = self.transport.as_ref();
        let config = &ctx.config;

        let directory = async {
            if let Some(owner) = config.owner {
                transport.chown(&self.remote_dir, owner.uid, owner.gid).await?;
            }
            if let Some(mode) = config.dir_mode {
                transport.chmod(&self.remote_dir, mode).await?;
            }
            Ok::<_, RemoteError>(())
        };
        let file = async {
            if let Some(owner) = config.owner {
                transport.chown(remote_path, owner.uid, owner.gid).await?;
            }
            if let Some(mode) = config.file_mode {
                transport.chmod(remote_path, mode).await?;
            }
            Ok::<_, RemoteError>(())
        };

        tokio::try_join!(directory, file)?;
        Ok(())
    }
}

#[async_trait]
impl Task for TransferTask {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn attach_tracker(&mut self, tracker: Tracker) {
        self.tracker = Some(tracker);
    }

    fn attach_output(&mut self, sink: OutputSink) {
        self.output = Some(sink);
    }

    async fn run(&mut self, ctx: &TaskContext) -> Result<Characteristics> {
        ctx.checkpoint()?;
        let size = tokio::fs::metadata(&self.local_path)
            .await
            .with_context(|| format!("Cannot read {}", self.local_path.display()))?
            .len();

        self.transport
            .mkdir_all(&self.remote_dir)
            .await
            .with_context(|| format!("Failed to create remote directory {}", self.remote_dir.display()))?;
        self.set_value(1);

        ctx.checkpoint()?;
        let command = self.command(&ctx.config.rsync_bin, &ctx.config.ssh_bin);
        run_with_progress(
            &command,
            ProgressPattern::transfer(),
            PollOptions::every(ctx.config.poll_interval()).clamped(2..=99),
            self.tracker.as_ref(),
            self.output.clone(),
        )
        .await?;

        if ctx.config.keep_original {
            debug!("{}: keeping local copy", self.display_name);
        } else {
            tokio::fs::remove_file(&self.local_path)
                .await
                .with_context(|| format!("Failed to delete local {}", self.local_path.display()))?;
        }

        let remote_path = self.remote_path();
        self.finalize(ctx, &remote_path)
            .await
            .with_context(|| format!("Failed to set owner/mode on {}", remote_path.display()))?;
        self.set_value(100);

        let size = format_size(size, BINARY);
        info!("{}: uploaded {} to {}", self.display_name, size, remote_path.display());

        let mut characteristics = Characteristics::new();
        characteristics.insert("size".to_string(), size);
        characteristics.insert("remote".to_string(), remote_path.display().to_string());
        Ok(characteristics)
    }
}
