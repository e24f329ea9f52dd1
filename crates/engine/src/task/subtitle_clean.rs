use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use crate::ledger::BackupLedger;
use crate::srt;
use crate::tool::OutputSink;
use crate::tracker::Tracker;
use super::{file_label, Characteristics, Task, TaskContext};

/// Collapse SubRip cues that repeat the previous cue's timing
pub struct SubtitleCleanTask {
    path: PathBuf,
    display_name: String,
    tracker: Option<Tracker>,
}

impl SubtitleCleanTask {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display_name = file_label(&path);
        SubtitleCleanTask {
            path,
            display_name,
            tracker: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_value(&self, value: u8) {
        if let Some(tracker) = &self.tracker {
            tracker.set_value(value);
        }
    }
}

#[async_trait]
impl Task for SubtitleCleanTask {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn attach_tracker(&mut self, tracker: Tracker) {
        self.tracker = Some(tracker);
    }

    // No external tool, nothing to mirror.
    fn attach_output(&mut self, _sink: OutputSink) {}

    async fn run(&mut self, ctx: &TaskContext) -> Result<Characteristics> {
        ctx.checkpoint()?;
        let input = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let cues = srt::parse(&input).with_context(|| format!("Failed to parse {}", self.path.display()))?;
        let before = cues.len();
        let merged = srt::merge_duplicates(cues);
        self.set_value(50);

        let mut characteristics = Characteristics::new();
        characteristics.insert("cues".to_string(), merged.len().to_string());
        characteristics.insert("merged".to_string(), (before - merged.len()).to_string());

        if merged.len() == before {
            info!("{}: nothing to merge", self.display_name);
            self.set_value(100);
            return Ok(characteristics);
        }

        let rendered = srt::render(&merged);
        replace_file(&self.path, &self.display_name, ctx.config.keep_original, |path| async move {
            tokio::fs::write(path, rendered).await
        })
        .await?;

        info!("{}: merged {} duplicate cue(s)", self.display_name, before - merged.len());
        self.set_value(100);
        Ok(characteristics)
    }
}

/// Back up `path`, then let `write` produce the new contents.
///
/// A failed write removes whatever was written and restores the backup.
async fn replace_file<F, Fut>(path: &Path, label: &str, keep_original: bool, write: F) -> Result<()>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut ledger = BackupLedger::new();
    ledger.begin_backup(path).await?;

    if let Err(e) = write(path.to_path_buf()).await {
        if let Err(re) = tokio::fs::remove_file(path).await {
            if re.kind() != io::ErrorKind::NotFound {
                warn!("{}: failed to remove partial write: {}", label, re);
            }
        }
        let e = anyhow::Error::new(e).context(format!("Failed to write {}", path.display()));
        return match ledger.rollback().await {
            Ok(()) => Err(e),
            Err(re) => Err(e.context(format!("rollback was incomplete: {}", re))),
        };
    }

    if keep_original {
        ledger.keep();
    } else if let Err(e) = ledger.commit().await {
        warn!("{}: {}", label, e);
    }
    Ok(())
}
