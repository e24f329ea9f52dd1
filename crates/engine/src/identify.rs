use std::path::Path;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use crate::tool::ToolCommand;

/// Identification report produced by `mkvmerge --identify`
#[derive(Debug, Clone, Deserialize)]
pub struct MkvIdentification {
    #[serde(default)]
    pub tracks: Vec<MkvTrack>,
}

/// Kind of a container track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitles,
    #[serde(other)]
    Unknown,
}

impl TrackKind {
    /// Selector prefix used by mkvpropedit (`track:a1`)
    pub fn selector(self) -> Option<char> {
        match self {
            TrackKind::Video => Some('v'),
            TrackKind::Audio => Some('a'),
            TrackKind::Subtitles => Some('s'),
            TrackKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MkvTrack {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub properties: TrackProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackProperties {
    pub language: Option<String>,
    pub language_ietf: Option<String>,
    pub track_name: Option<String>,
    #[serde(default)]
    pub forced_track: bool,
    #[serde(default)]
    pub default_track: bool,
    pub number: Option<u32>,
}

impl MkvTrack {
    /// Best language tag available, preferring the legacy ISO 639-2 one
    pub fn language(&self) -> Option<&str> {
        self.properties
            .language
            .as_deref()
            .or(self.properties.language_ietf.as_deref())
    }

    /// Forced flag set, or a name announcing forced subtitles
    pub fn is_forced(&self) -> bool {
        self.properties.forced_track
            || self
                .properties
                .track_name
                .as_deref()
                .map(|n| n.to_lowercase().contains("forc"))
                .unwrap_or(false)
    }
}

impl MkvIdentification {
    /// Tracks of `kind` in container order
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MkvTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }
}

pub fn parse_identification(json: &str) -> Result<MkvIdentification> {
    serde_json::from_str(json).context("Failed to parse mkvmerge identification JSON")
}

/// Run mkvmerge in identify mode and parse its JSON report
pub async fn identify(mkvmerge: &Path, file_path: &Path) -> Result<MkvIdentification> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let output = ToolCommand::new(mkvmerge)
        .arg("--identification-format")
        .arg("json")
        .arg("--identify")
        .arg(file_path)
        .capture()
        .await
        .with_context(|| format!("Failed to identify: {}", file_path.display()))?;

    let report = parse_identification(&output).with_context(|| format!("Bad report for: {}", file_path.display()))?;
    debug!("{}: {} track(s)", file_path.display(), report.tracks.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "container": {"recognized": true, "supported": true, "type": "Matroska"},
        "tracks": [
            {"id": 0, "type": "video", "codec": "HEVC/H.265/MPEG-H",
             "properties": {"language": "eng", "track_name": "x265 release", "number": 1}},
            {"id": 1, "type": "audio", "codec": "AAC",
             "properties": {"language": "ger", "track_name": "Deutsch 5.1", "default_track": true, "number": 2}},
            {"id": 2, "type": "subtitles", "codec": "SubRip/SRT",
             "properties": {"language": "eng", "track_name": "Forced", "number": 3}},
            {"id": 3, "type": "subtitles", "codec": "SubRip/SRT",
             "properties": {"language_ietf": "fr", "forced_track": false, "number": 4}},
            {"id": 4, "type": "buttons", "properties": {}}
        ]
    }"#;

    #[test]
    fn test_parse_report() {
        let report = parse_identification(REPORT).unwrap();
        assert_eq!(report.tracks.len(), 5);
        assert_eq!(report.tracks[0].kind, TrackKind::Video);
        assert_eq!(report.tracks[4].kind, TrackKind::Unknown);
        assert_eq!(report.tracks_of(TrackKind::Subtitles).count(), 2);
        assert_eq!(report.tracks[3].language(), Some("fr"));
    }

    #[test]
    fn test_forced_detection() {
        let report = parse_identification(REPORT).unwrap();
        assert!(report.tracks[2].is_forced());
        assert!(!report.tracks[3].is_forced());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_identification("mkvmerge: not a file").is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = identify(Path::new("mkvmerge"), Path::new("/nonexistent/movie.mkv")).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
