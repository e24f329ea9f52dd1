use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use crate::language::normalize_language;
use crate::ledger::BackupLedger;
use crate::media::MediaFile;
use crate::progress::{PollOptions, ProgressPattern};
use crate::tool::{OutputSink, ToolCommand};
use crate::tracker::Tracker;
use super::{apply_local_ownership, run_with_progress, Characteristics, Task, TaskContext};

/// Mux sidecar subtitles into a Matroska container with mkvmerge.
///
/// The video and every subtitle are moved to backups first and fed to the
/// tool from there, so the output can land on the original video path. A
/// failed run restores all of them; a successful one deletes them unless
/// originals are kept.
pub struct MergeTask {
    file: MediaFile,
    destination: PathBuf,
    display_name: String,
    tracker: Option<Tracker>,
    output: Option<OutputSink>,
}

impl MergeTask {
    pub fn new(file: MediaFile, destination: impl Into<PathBuf>) -> Self {
        let display_name = file.basename();
        MergeTask {
            file,
            destination: destination.into(),
            display_name,
            tracker: None,
            output: None,
        }
    }

    pub fn file(&self) -> &MediaFile {
        &self.file
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn command(&self, mkvmerge: &Path, video: &Path, subtitles: &[(String, PathBuf)]) -> ToolCommand {
        let mut command = ToolCommand::new(mkvmerge)
            .arg("--output")
            .arg(&self.destination);
        for (language, path) in subtitles {
            command = command
                .arg("--language")
                .arg(format!("0:{}", normalize_language(language)))
                .arg(path);
        }
        // mkvmerge exits 1 when it finished with warnings.
        command.arg(video).accept_exit_code(1)
    }
}

#[async_trait]
impl Task for MergeTask {
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
        let mut characteristics = Characteristics::new();
        let subtitle_count = self.file.subtitles().len();
        characteristics.insert("subtitles".to_string(), subtitle_count.to_string());

        if subtitle_count == 0 {
            info!("{}: no subtitles to merge", self.display_name);
            if let Some(tracker) = &self.tracker {
                tracker.set_value(100);
                tracker.mark_done();
            }
            return Ok(characteristics);
        }

        ctx.checkpoint()?;
        let video = self.file.file_path().to_path_buf();
        if self.destination.exists() && self.destination != video {
            bail!("Destination already exists: {}", self.destination.display());
        }

        let mut ledger = BackupLedger::new();
        let video_backup = ledger
            .begin_backup(&video)
            .await
            .with_context(|| format!("Failed to back up video: {}", video.display()))?
            .current_path;

        let mut subtitle_backups = Vec::with_capacity(subtitle_count);
        for (language, path) in self.file.subtitles() {
            match ledger.begin_backup(path).await {
                Ok(record) => subtitle_backups.push((language.clone(), record.current_path)),
                Err(e) => {
                    if let Err(re) = ledger.rollback().await {
                        warn!("{}: {}", self.display_name, re);
                    }
                    return Err(e).with_context(|| format!("Failed to back up subtitle: {}", path.display()));
                }
            }
        }

        let command = self.command(&ctx.config.mkvmerge_bin, &video_backup, &subtitle_backups);
        let outcome = match ctx.checkpoint() {
            Ok(()) => run_with_progress(
                &command,
                ProgressPattern::merge(),
                PollOptions::every(ctx.config.poll_interval()),
                self.tracker.as_ref(),
                self.output.clone(),
            )
            .await
            .map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            // Partial output first, then put the sources back where they were.
            match tokio::fs::remove_file(&self.destination).await {
                Ok(()) => info!("{}: removed partial output {}", self.display_name, self.destination.display()),
                Err(re) if re.kind() == std::io::ErrorKind::NotFound => {}
                Err(re) => warn!("{}: failed to remove partial output: {}", self.display_name, re),
            }
            if let Err(re) = ledger.rollback().await {
                return Err(e.context(format!("merge failed and rollback was incomplete: {}", re)));
            }
            return Err(e.context("merge failed, sources restored"));
        }

        // Ownership problems do not undo a finished merge.
        if let Err(e) = apply_local_ownership(&self.destination, ctx.config.owner, ctx.config.file_mode) {
            warn!(
                "{}: failed to set owner/mode on {}: {}",
                self.display_name,
                self.destination.display(),
                e
            );
        }

        if ctx.config.keep_original {
            let kept = ledger.keep();
            info!("{}: kept {} original(s) as backups", self.display_name, kept.len());
        } else if let Err(e) = ledger.commit().await {
            warn!("{}: {}", self.display_name, e);
        }

        self.file.set_file_path(&self.destination);
        self.file.clear_subtitles();
        characteristics.insert("output".to_string(), self.destination.display().to_string());
        info!("{}: merged {} subtitle(s) into {}", self.display_name, subtitle_count, self.destination.display());
        Ok(characteristics)
    }
}
