use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::Result;
use log::{debug, info, warn};
use walkdir::WalkDir;

/// Container extensions treated as videos
const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// Sidecar subtitle extensions
const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "ass", "ssa"];

/// A video on disk and its sidecar subtitles keyed by language code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    file_path: PathBuf,
    subtitles: BTreeMap<String, PathBuf>,
}

impl MediaFile {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        MediaFile {
            file_path: file_path.into(),
            subtitles: BTreeMap::new(),
        }
    }

    pub fn with_subtitle(mut self, language: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.subtitles.insert(language.into(), path.into());
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// File name without extension
    pub fn basename(&self) -> String {
        self.file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        self.file_path
            .extension()
            .map(|s| s.to_string_lossy().to_lowercase())
    }

    pub fn subtitles(&self) -> &BTreeMap<String, PathBuf> {
        &self.subtitles
    }

    /// Record a new on-disk location after the file was rewritten elsewhere
    pub fn set_file_path(&mut self, path: impl Into<PathBuf>) {
        self.file_path = path.into();
    }

    /// Forget sidecars that were consumed (e.g. merged into the container)
    pub fn clear_subtitles(&mut self) {
        self.subtitles.clear();
    }
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| allowed.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_video(path: &Path) -> bool {
    has_extension(path, VIDEO_EXTENSIONS)
}

pub fn is_subtitle(path: &Path) -> bool {
    has_extension(path, SUBTITLE_EXTENSIONS)
}

/// Split `Show - S01E01.eng.srt` into (`Show - S01E01`, `eng`)
pub fn subtitle_language(path: &Path) -> Option<(String, String)> {
    if !is_subtitle(path) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (video_stem, language) = stem.rsplit_once('.')?;
    let valid = (2..=3).contains(&language.len()) && language.chars().all(|c| c.is_ascii_alphabetic());
    if !valid || video_stem.is_empty() {
        return None;
    }
    Some((video_stem.to_string(), language.to_lowercase()))
}

fn walk_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        if !root.exists() {
            warn!("Path does not exist: {}", root.display());
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Find videos under `roots` and pair each with `<stem>.<lang>.<ext>` sidecars
/// living in the same directory
pub fn discover_media(roots: &[PathBuf]) -> Result<Vec<MediaFile>> {
    let files = walk_files(roots);

    let mut subtitles: BTreeMap<(PathBuf, String), Vec<(String, PathBuf)>> = BTreeMap::new();
    for path in files.iter().filter(|p| is_subtitle(p)) {
        if let Some((video_stem, language)) = subtitle_language(path) {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            subtitles
                .entry((dir, video_stem))
                .or_default()
                .push((language, path.clone()));
        }
    }

    let mut media = Vec::new();
    for path in files.iter().filter(|p| is_video(p)) {
        let mut file = MediaFile::new(path.clone());
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if let Some(found) = subtitles.get(&(dir, file.basename())) {
            for (language, sub) in found {
                if file.subtitles.contains_key(language) {
                    warn!("Ignoring duplicate {} subtitle {}", language, sub.display());
                    continue;
                }
                file = file.with_subtitle(language.clone(), sub.clone());
            }
        }
        debug!("Found media file: {} ({} subtitle(s))", path.display(), file.subtitles.len());
        media.push(file);
    }

    info!("Discovery complete: {} video(s) under {} path(s)", media.len(), roots.len());
    Ok(media)
}

/// Find sidecar subtitle files under `roots`
pub fn discover_subtitles(roots: &[PathBuf]) -> Vec<PathBuf> {
    walk_files(roots).into_iter().filter(|p| is_subtitle(p)).collect()
}

/// Find any regular files under `roots` (uploads)
pub fn discover_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    walk_files(roots)
        .into_iter()
        .filter(|p| !p.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(".bak")).unwrap_or(false))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_media_file_accessors() {
        let mut file = MediaFile::new("/tv/Show/Show - S01E02.MKV").with_subtitle("eng", "/tv/Show/Show - S01E02.eng.srt");
        assert_eq!(file.basename(), "Show - S01E02");
        assert_eq!(file.extension().as_deref(), Some("mkv"));
        assert_eq!(file.subtitles().len(), 1);

        file.set_file_path("/tv/Show/Season 01/Show - S01E02.mkv");
        file.clear_subtitles();
        assert_eq!(file.file_path(), Path::new("/tv/Show/Season 01/Show - S01E02.mkv"));
        assert!(file.subtitles().is_empty());
    }

    #[test]
    fn test_subtitle_language() {
        assert_eq!(
            subtitle_language(Path::new("/a/Movie (2020).fre.srt")),
            Some(("Movie (2020)".to_string(), "fre".to_string()))
        );
        assert_eq!(
            subtitle_language(Path::new("/a/Movie.EN.ass")),
            Some(("Movie".to_string(), "en".to_string()))
        );
        assert_eq!(subtitle_language(Path::new("/a/Movie.srt")), None);
        assert_eq!(subtitle_language(Path::new("/a/Movie.forced.srt")), None);
        assert_eq!(subtitle_language(Path::new("/a/Movie.eng.mkv")), None);
    }

    #[test]
    fn test_discover_pairs_sidecars_in_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let season = dir.path().join("Season 01");
        fs::create_dir(&season).unwrap();
        fs::write(season.join("Show - S01E01.mkv"), b"").unwrap();
        fs::write(season.join("Show - S01E01.eng.srt"), b"").unwrap();
        fs::write(season.join("Show - S01E01.fre.srt"), b"").unwrap();
        fs::write(season.join("Show - S01E02.mp4"), b"").unwrap();
        fs::write(dir.path().join("Show - S01E02.eng.srt"), b"").unwrap();
        fs::write(season.join("notes.txt"), b"").unwrap();

        let media = discover_media(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(media.len(), 2);
        let first = &media[0];
        assert_eq!(first.basename(), "Show - S01E01");
        assert_eq!(first.subtitles().keys().collect::<Vec<_>>(), vec!["eng", "fre"]);
        assert!(media[1].subtitles().is_empty());

        assert_eq!(discover_subtitles(&[dir.path().to_path_buf()]).len(), 3);
    }

    #[test]
    fn test_discover_files_skips_backups() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"").unwrap();
        fs::write(dir.path().join("_a.mkv.bak"), b"").unwrap();
        assert_eq!(discover_files(&[dir.path().to_path_buf()]), vec![dir.path().join("a.mkv")]);
    }
}
