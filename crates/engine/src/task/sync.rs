use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use crate::language::normalize_language;
use crate::ledger::BackupLedger;
use crate::progress::{PollOptions, ProgressPattern};
use crate::tool::{OutputSink, ToolCommand};
use crate::tracker::Tracker;
use super::{file_label, run_with_progress, Characteristics, Task, TaskContext};

/// Re-time a subtitle against the audio of its video with subsync.
///
/// The subtitle is moved to its backup and used as the tool's input; the
/// synchronized output is written to the original path.
pub struct SyncTask {
    video: PathBuf,
    subtitle: PathBuf,
    ref_lang: String,
    sub_lang: String,
    ref_stream_by_lang: Option<String>,
    ref_stream_by_type: Option<String>,
    display_name: String,
    tracker: Option<Tracker>,
    output: Option<OutputSink>,
}

impl SyncTask {
    pub fn new(video: impl Into<PathBuf>, subtitle: impl Into<PathBuf>, ref_lang: &str, sub_lang: &str) -> Self {
        let subtitle = subtitle.into();
        let display_name = file_label(&subtitle);
        SyncTask {
            video: video.into(),
            subtitle,
            ref_lang: normalize_language(ref_lang),
            sub_lang: normalize_language(sub_lang),
            ref_stream_by_lang: None,
            ref_stream_by_type: None,
            display_name,
            tracker: None,
            output: None,
        }
    }

    /// Pick the reference audio stream by its language tag
    pub fn ref_stream_by_lang(mut self, language: &str) -> Self {
        self.ref_stream_by_lang = Some(normalize_language(language));
        self
    }

    /// Pick the reference stream by type (`audio`, `sub`)
    pub fn ref_stream_by_type(mut self, kind: impl Into<String>) -> Self {
        self.ref_stream_by_type = Some(kind.into());
        self
    }

    pub fn subtitle(&self) -> &Path {
        &self.subtitle
    }

    fn command(&self, subsync: &Path, input: &Path) -> ToolCommand {
        let mut command = ToolCommand::new(subsync)
            .args(["--cli", "--offline", "sync"])
            .arg("--ref")
            .arg(&self.video)
            .arg("--ref-lang")
            .arg(&self.ref_lang)
            .arg("--sub")
            .arg(input)
            .arg("--sub-lang")
            .arg(&self.sub_lang)
            .arg("--out")
            .arg(&self.subtitle);
        if let Some(language) = &self.ref_stream_by_lang {
            command = command.arg("--ref-stream-by-lang").arg(language);
        }
        if let Some(kind) = &self.ref_stream_by_type {
            command = command.arg("--ref-stream-by-type").arg(kind);
        }
        command
    }
}

#[async_trait]
impl Task for SyncTask {
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
        if !self.video.is_file() {
            bail!("Reference video does not exist: {}", self.video.display());
        }

        let mut ledger = BackupLedger::new();
        let input = ledger
            .begin_backup(&self.subtitle)
            .await
            .with_context(|| format!("Failed to back up {}", self.subtitle.display()))?
            .current_path;

        let command = self.command(&ctx.config.subsync_bin, &input);
        let outcome = match ctx.checkpoint() {
            Ok(()) => run_with_progress(
                &command,
                ProgressPattern::sync(),
                PollOptions::every(ctx.config.poll_interval()).with_auxiliary_label("score"),
                self.tracker.as_ref(),
                self.output.clone(),
            )
            .await
            .map(|(_, last)| last),
            Err(e) => Err(e),
        };

        let last = match outcome {
            Ok(last) => last,
            Err(e) => {
                match tokio::fs::remove_file(&self.subtitle).await {
                    Ok(()) => {}
                    Err(re) if re.kind() == std::io::ErrorKind::NotFound => {}
                    Err(re) => warn!("{}: failed to remove partial output: {}", self.display_name, re),
                }
                if let Err(re) = ledger.rollback().await {
                    return Err(e.context(format!("sync failed and rollback was incomplete: {}", re)));
                }
                return Err(e.context("sync failed, subtitle restored"));
            }
        };

        if !self.subtitle.exists() {
            if let Err(re) = ledger.rollback().await {
                warn!("{}: {}", self.display_name, re);
            }
            bail!("subsync reported success but wrote no output");
        }

        if ctx.config.keep_original {
            ledger.keep();
        } else if let Err(e) = ledger.commit().await {
            warn!("{}: {}", self.display_name, e);
        }

        let mut characteristics = Characteristics::new();
        if let Some(score) = last.and_then(|r| r.auxiliary) {
            characteristics.insert("score".to_string(), format!("{:.2}", score));
        }
        info!("{}: synchronized against {}", self.display_name, file_label(&self.video));
        Ok(characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let task = SyncTask::new("/m/movie.mkv", "/m/movie.en.srt", "en", "eng").ref_stream_by_lang("ja");
        assert_eq!(
            task.command(Path::new("subsync"), Path::new("/m/_movie.en.srt.bak")).command_line(),
            "subsync --cli --offline sync --ref /m/movie.mkv --ref-lang eng --sub /m/_movie.en.srt.bak \
             --sub-lang eng --out /m/movie.en.srt --ref-stream-by-lang jpn"
        );
    }

    #[cfg(unix)]
    mod e2e {
        use super::super::*;
        use std::fs;
        use crate::config::EngineConfig;
        use crate::task::testing::{context, entries, fake_tool};

        /// Copies --sub to --out after reporting progress
        const SUBSYNC_OK: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in
    --sub) sub="$2"; shift 2 ;;
    --out) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "progress 40.00%, 80 points, correlation=71.50%"
sleep 0.05
echo "progress 100.00%, 200 points, correlation=93.25%"
cp "$sub" "$out""#;

        const SUBSYNC_FAIL: &str = r#"while [ $# -gt 0 ]; do
  case "$1" in
    --out) printf 'junk' > "$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "progress 10.00%"
echo "no speech found" >&2
exit 1"#;

        fn setup(dir: &Path) -> (PathBuf, PathBuf) {
            let video = dir.join("movie.mkv");
            let subtitle = dir.join("movie.eng.srt");
            fs::write(&video, b"video").unwrap();
            fs::write(&subtitle, b"original").unwrap();
            (video, subtitle)
        }

        #[tokio::test]
        async fn test_sync_reports_score() {
            let tools = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let (video, subtitle) = setup(dir.path());

            let tracker = Tracker::new();
            tracker.start();
            let mut task = SyncTask::new(&video, &subtitle, "eng", "eng");
            task.attach_tracker(tracker.clone());
            let ctx = context(EngineConfig {
                subsync_bin: fake_tool(tools.path(), "subsync", SUBSYNC_OK),
                ..Default::default()
            });

            let characteristics = task.run(&ctx).await.unwrap();
            assert_eq!(characteristics["score"], "93.25");
            assert_eq!(tracker.value(), 100);
            assert_eq!(tracker.snapshot().message, "score 93.25");
            assert_eq!(entries(dir.path()), vec!["movie.eng.srt", "movie.mkv"]);
        }

        #[tokio::test]
        async fn test_failed_sync_restores_subtitle() {
            let tools = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let (video, subtitle) = setup(dir.path());

            let mut task = SyncTask::new(&video, &subtitle, "eng", "eng");
            let ctx = context(EngineConfig {
                subsync_bin: fake_tool(tools.path(), "subsync", SUBSYNC_FAIL),
                ..Default::default()
            });

            let err = task.run(&ctx).await.unwrap_err();
            assert!(format!("{:#}", err).contains("no speech found"), "{:#}", err);
            assert_eq!(fs::read(&subtitle).unwrap(), b"original");
            assert_eq!(entries(dir.path()), vec!["movie.eng.srt", "movie.mkv"]);
        }

        #[tokio::test]
        async fn test_missing_video_touches_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let subtitle = dir.path().join("movie.eng.srt");
            fs::write(&subtitle, b"original").unwrap();

            let mut task = SyncTask::new(dir.path().join("movie.mkv"), &subtitle, "eng", "eng");
            assert!(task.run(&context(EngineConfig::default())).await.is_err());
            assert_eq!(entries(dir.path()), vec!["movie.eng.srt"]);
        }
    }
}
