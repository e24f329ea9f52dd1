use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use crate::identify::{identify, MkvIdentification, TrackKind};
use crate::language::{display_name, normalize_language, UNDETERMINED};
use crate::progress::{PollOptions, ProgressPattern};
use crate::tool::{OutputSink, ToolCommand};
use crate::tracker::Tracker;
use super::{file_label, run_with_progress, Characteristics, Task, TaskContext};

/// Property edits for one track, in mkvpropedit selector form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEdit {
    pub selector: String,
    pub properties: Vec<(&'static str, String)>,
}

/// Derive the edits that normalize every known track of a container.
///
/// Audio gets a normalized language and no name, video is marked
/// undetermined with no name, subtitles are named after their language and
/// flagged forced+default when they look forced.
pub fn derive_edits(report: &MkvIdentification) -> Vec<TrackEdit> {
    let mut edits = Vec::new();
    for kind in [TrackKind::Video, TrackKind::Audio, TrackKind::Subtitles] {
        let Some(prefix) = kind.selector() else { continue };
        for (i, track) in report.tracks_of(kind).enumerate() {
            let selector = format!("track:{}{}", prefix, i + 1);
            let properties = match kind {
                TrackKind::Video => vec![
                    ("language", UNDETERMINED.to_string()),
                    ("name", String::new()),
                ],
                TrackKind::Audio => vec![
                    ("language", normalize_language(track.language().unwrap_or(UNDETERMINED))),
                    ("name", String::new()),
                ],
                TrackKind::Subtitles => {
                    let language = normalize_language(track.language().unwrap_or(UNDETERMINED));
                    let mut name = display_name(&language);
                    let mut properties = vec![("language", language)];
                    if track.is_forced() {
                        name.push_str(" (Forced)");
                        properties.push(("flag-forced", "1".to_string()));
                        properties.push(("flag-default", "1".to_string()));
                    }
                    properties.push(("name", name));
                    properties
                }
                TrackKind::Unknown => continue,
            };
            edits.push(TrackEdit { selector, properties });
        }
    }
    edits
}

/// Normalize container and track metadata in place with mkvpropedit
pub struct TrackCleanTask {
    file_path: PathBuf,
    display_name: String,
    tracker: Option<Tracker>,
    output: Option<OutputSink>,
}

impl TrackCleanTask {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let display_name = file_label(&file_path);
        TrackCleanTask {
            file_path,
            display_name,
            tracker: None,
            output: None,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn command(&self, mkvpropedit: &Path, edits: &[TrackEdit]) -> ToolCommand {
        let mut command = ToolCommand::new(mkvpropedit)
            .arg(&self.file_path)
            .args(["--edit", "info", "--set", "title=", "--tags", "all:"]);
        for edit in edits {
            command = command.arg("--edit").arg(&edit.selector);
            for (key, value) in &edit.properties {
                command = command.arg("--set").arg(format!("{}={}", key, value));
            }
        }
        command
    }
}

#[async_trait]
impl Task for TrackCleanTask {
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
        let report = identify(&ctx.config.mkvmerge_bin, &self.file_path)
            .await
            .context("Cannot read track layout, leaving file untouched")?;

        let edits = derive_edits(&report);
        debug!("{}: {:?}", self.display_name, edits);

        ctx.checkpoint()?;
        let command = self.command(&ctx.config.mkvpropedit_bin, &edits);
        run_with_progress(
            &command,
            ProgressPattern::merge(),
            PollOptions::every(ctx.config.poll_interval()),
            self.tracker.as_ref(),
            self.output.clone(),
        )
        .await?;

        let forced = report
            .tracks_of(TrackKind::Subtitles)
            .filter(|t| t.is_forced())
            .count();
        info!("{}: cleaned {} track(s)", self.display_name, edits.len());

        let mut characteristics = Characteristics::new();
        characteristics.insert("tracks".to_string(), edits.len().to_string());
        characteristics.insert("forced".to_string(), forced.to_string());
        Ok(characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::parse_identification;

    const REPORT: &str = r#"{"tracks": [
        {"id": 0, "type": "video", "properties": {"language": "eng", "track_name": "x265"}},
        {"id": 1, "type": "audio", "properties": {"language": "en", "track_name": "Stereo"}},
        {"id": 2, "type": "audio", "properties": {}},
        {"id": 3, "type": "subtitles", "properties": {"language": "fre"}},
        {"id": 4, "type": "subtitles", "properties": {"language": "eng", "track_name": "English FORCED"}},
        {"id": 5, "type": "subtitles", "properties": {"language": "ger", "forced_track": true}}
    ]}"#;

    fn set(pairs: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_derive_edits() {
        let edits = derive_edits(&parse_identification(REPORT).unwrap());
        assert_eq!(
            edits,
            vec![
                TrackEdit { selector: "track:v1".into(), properties: set(&[("language", "und"), ("name", "")]) },
                TrackEdit { selector: "track:a1".into(), properties: set(&[("language", "eng"), ("name", "")]) },
                TrackEdit { selector: "track:a2".into(), properties: set(&[("language", "und"), ("name", "")]) },
                TrackEdit {
                    selector: "track:s1".into(),
                    properties: set(&[("language", "fre"), ("name", "French")]),
                },
                TrackEdit {
                    selector: "track:s2".into(),
                    properties: set(&[
                        ("language", "eng"),
                        ("flag-forced", "1"),
                        ("flag-default", "1"),
                        ("name", "English (Forced)"),
                    ]),
                },
                TrackEdit {
                    selector: "track:s3".into(),
                    properties: set(&[
                        ("language", "ger"),
                        ("flag-forced", "1"),
                        ("flag-default", "1"),
                        ("name", "German (Forced)"),
                    ]),
                },
            ]
        );
    }

    #[test]
    fn test_command_line() {
        let task = TrackCleanTask::new("/media/movie.mkv");
        let edits = derive_edits(&parse_identification(r#"{"tracks": [{"id": 0, "type": "audio", "properties": {"language": "ja"}}]}"#).unwrap());
        let command = task.command(Path::new("mkvpropedit"), &edits);
        assert_eq!(
            command.command_line(),
            "mkvpropedit /media/movie.mkv --edit info --set title= --tags all: --edit track:a1 --set language=jpn --set name="
        );
    }

    #[cfg(unix)]
    mod e2e {
        use super::super::*;
        use std::fs;
        use crate::config::EngineConfig;
        use crate::task::testing::{context, fake_tool};

        #[tokio::test]
        async fn test_bad_report_means_no_edit() {
            let tools = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let movie = dir.path().join("movie.mkv");
            fs::write(&movie, b"video").unwrap();
            let marker = dir.path().join("edited");

            let mut task = TrackCleanTask::new(&movie);
            let ctx = context(EngineConfig {
                mkvmerge_bin: fake_tool(tools.path(), "mkvmerge", "echo 'not json'"),
                mkvpropedit_bin: fake_tool(tools.path(), "mkvpropedit", &format!("touch '{}'", marker.display())),
                ..Default::default()
            });

            assert!(task.run(&ctx).await.is_err());
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn test_clean_runs_editor() {
            let tools = tempfile::tempdir().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let movie = dir.path().join("movie.mkv");
            fs::write(&movie, b"video").unwrap();
            let args = dir.path().join("args");

            let report = r#"{"tracks": [{"id": 0, "type": "subtitles", "properties": {"language": "eng"}}]}"#;
            let mut task = TrackCleanTask::new(&movie);
            let ctx = context(EngineConfig {
                mkvmerge_bin: fake_tool(tools.path(), "mkvmerge", &format!("echo '{}'", report)),
                mkvpropedit_bin: fake_tool(tools.path(), "mkvpropedit", &format!("echo \"$@\" > '{}'", args.display())),
                ..Default::default()
            });

            let characteristics = task.run(&ctx).await.unwrap();
            assert_eq!(characteristics["tracks"], "1");
            let recorded = fs::read_to_string(&args).unwrap();
            assert!(recorded.contains("--edit track:s1 --set language=eng --set name=English"), "{}", recorded);
        }
    }
}
