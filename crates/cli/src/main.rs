use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use chrono::Local;
use engine::{
    config::EngineConfig,
    display::ProgressDisplay,
    media::{self, MediaFile},
    placement::PlacementSelector,
    remote::SshTransport,
    scheduler::{BatchReport, Scheduler},
    task::{MergeTask, SubtitleCleanTask, SyncTask, Task, TrackCleanTask, TransferTask},
    tool::{require_tool, OutputSink},
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use log::{debug, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

/// Media library maintenance: merge, clean, sync and upload
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Maximum number of tasks running at once
    #[arg(short = 'j', long, global = true)]
    concurrency: Option<usize>,

    /// Keep originals (as `_<name>.bak` for local edits, the local copy for uploads)
    #[arg(long, global = true)]
    keep_original: bool,

    /// Append the raw stdout of every external tool to this file
    #[arg(long, global = true)]
    tool_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge `<name>.<lang>.srt` sidecars into Matroska containers
    Merge {
        /// Videos or directories to scan
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory receiving the merged files (default: next to each video)
        #[arg(long)]
        into: Option<PathBuf>,
    },

    /// Normalize track languages, names and forced flags of .mkv files
    CleanTracks {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Merge duplicated cues of .srt files
    CleanSubs {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Re-time sidecar subtitles against the audio of their video
    SyncSubs {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Language spoken in the reference video
        #[arg(long, default_value = "eng")]
        ref_lang: String,

        /// Subtitle language (default: taken from the file name)
        #[arg(long)]
        sub_lang: Option<String>,

        /// Select the reference audio stream by language
        #[arg(long)]
        ref_stream_by_lang: Option<String>,

        /// Select the reference stream by type (audio, sub)
        #[arg(long)]
        ref_stream_by_type: Option<String>,
    },

    /// Upload files to the least used remote root
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory relative to the chosen root, e.g. "Show/Season 01"
        #[arg(long)]
        into: PathBuf,
    },
}

/// Log target that clears the progress bars while a record is written
struct SuspendingWriter {
    display: ProgressDisplay,
}

impl Write for SuspendingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.display.suspend(|| std::io::stderr().write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

fn init_logging(verbose: bool, display: &ProgressDisplay) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .target(env_logger::Target::Pipe(Box::new(SuspendingWriter {
            display: display.clone(),
        })))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let display = ProgressDisplay::new();
    init_logging(args.verbose, &display);

    let mut cfg = EngineConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(concurrency) = args.concurrency {
        cfg.concurrency = concurrency;
    }
    if args.keep_original {
        cfg.keep_original = true;
    }
    cfg.validate()?;

    resolve_tools(&mut cfg, &args.command)?;
    debug!("Configuration: {:?}", cfg);

    let cfg = Arc::new(cfg);
    let tasks = build_tasks(&cfg, &args.command).await?;
    if tasks.is_empty() {
        warn!("Nothing to do");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, letting running tasks finish and skipping the rest");
                cancel.cancel();
            }
        });
    }

    let mut scheduler = Scheduler::new(cfg.clone())
        .with_cancellation(cancel)
        .with_display(display.clone());
    if let Some(path) = &args.tool_log {
        scheduler = scheduler.with_output(open_tool_log(path)?);
    }

    let report = scheduler.run(tasks).await;
    print_report(&report);
    report.check()?;
    Ok(())
}

/// Check every tool the command needs before any task runs
fn resolve_tools(cfg: &mut EngineConfig, command: &Command) -> Result<()> {
    let needed: Vec<&mut PathBuf> = match command {
        Command::Merge { .. } => vec![&mut cfg.mkvmerge_bin],
        Command::CleanTracks { .. } => vec![&mut cfg.mkvmerge_bin, &mut cfg.mkvpropedit_bin],
        Command::CleanSubs { .. } => vec![],
        Command::SyncSubs { .. } => vec![&mut cfg.subsync_bin],
        Command::Upload { .. } => vec![&mut cfg.rsync_bin, &mut cfg.ssh_bin],
    };
    for tool in needed {
        let resolved = require_tool(tool.as_path())?;
        debug!("Using {}", resolved.display());
        *tool = resolved;
    }
    Ok(())
}

async fn build_tasks(cfg: &EngineConfig, command: &Command) -> Result<Vec<Box<dyn Task>>> {
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    match command {
        Command::Merge { paths, into } => {
            if let Some(dir) = into {
                if !dir.is_dir() {
                    bail!("Destination is not a directory: {}", dir.display());
                }
            }
            for file in media::discover_media(paths)? {
                let destination = merge_destination(&file, into.as_deref());
                tasks.push(Box::new(MergeTask::new(file, destination)));
            }
        }
        Command::CleanTracks { paths } => {
            for file in media::discover_media(paths)? {
                if file.extension().as_deref() == Some("mkv") {
                    tasks.push(Box::new(TrackCleanTask::new(file.file_path())));
                } else {
                    debug!("Skipping non-Matroska file {}", file.file_path().display());
                }
            }
        }
        Command::CleanSubs { paths } => {
            for path in media::discover_subtitles(paths) {
                if has_extension(&path, "srt") {
                    tasks.push(Box::new(SubtitleCleanTask::new(path)));
                }
            }
        }
        Command::SyncSubs {
            paths,
            ref_lang,
            sub_lang,
            ref_stream_by_lang,
            ref_stream_by_type,
        } => {
            for file in media::discover_media(paths)? {
                for (language, subtitle) in file.subtitles() {
                    let mut task = SyncTask::new(
                        file.file_path(),
                        subtitle,
                        ref_lang,
                        sub_lang.as_deref().unwrap_or(language),
                    );
                    if let Some(language) = ref_stream_by_lang {
                        task = task.ref_stream_by_lang(language);
                    }
                    if let Some(kind) = ref_stream_by_type {
                        task = task.ref_stream_by_type(kind.clone());
                    }
                    tasks.push(Box::new(task));
                }
            }
        }
        Command::Upload { paths, into } => {
            if into.is_absolute() {
                bail!("--into must be relative to a remote root: {}", into.display());
            }
            let remote = cfg.remote()?;
            let transport = SshTransport::connect(&cfg.ssh_bin, &remote.host)
                .await
                .with_context(|| format!("Cannot reach {}", remote.host))?;
            let selector = PlacementSelector::query(&transport, &remote.roots, &remote.disk_usage_command).await?;
            let base = selector.place(into);
            info!("Uploading into {}:{}", remote.host, base.display());

            let transport = Arc::new(transport);
            for root in paths {
                for file in media::discover_files(std::slice::from_ref(root)) {
                    let remote_dir = upload_directory(&base, root, &file);
                    tasks.push(Box::new(TransferTask::new(file, remote_dir, transport.clone())));
                }
            }
        }
    }
    info!("Prepared {} task(s)", tasks.len());
    Ok(tasks)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// `<into or video dir>/<basename>.mkv`
fn merge_destination(file: &MediaFile, into: Option<&Path>) -> PathBuf {
    let name = format!("{}.mkv", file.basename());
    match into {
        Some(dir) => dir.join(name),
        None => file.file_path().with_file_name(name),
    }
}

/// Keep the layout below an uploaded directory; single files land in `base`
fn upload_directory(base: &Path, root: &Path, file: &Path) -> PathBuf {
    if root.is_dir() {
        let name = root.file_name().map(PathBuf::from).unwrap_or_default();
        let nested = file
            .parent()
            .and_then(|p| p.strip_prefix(root).ok())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        base.join(name).join(nested)
    } else {
        base.to_path_buf()
    }
}

fn open_tool_log(path: &Path) -> Result<OutputSink> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open tool log: {}", path.display()))?;
    Ok(Arc::new(Mutex::new(file)))
}

fn print_report(report: &BatchReport) {
    let width = report
        .results
        .iter()
        .map(|r| r.display_name.chars().count())
        .max()
        .unwrap_or(0);

    println!();
    for result in &report.results {
        let status = if result.is_successful { "OK  " } else { "FAIL" };
        let duration = result.characteristics.get("duration").map(String::as_str).unwrap_or("-");
        let extra: Vec<String> = result
            .characteristics
            .iter()
            .filter(|(k, _)| k.as_str() != "duration")
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{} {:<width$}  {:>10}  {}  {}",
            status,
            result.display_name,
            duration,
            result.started_at.with_timezone(&Local).format("%H:%M:%S"),
            extra.join(" "),
            width = width
        );
    }

    let failed: Vec<_> = report.failed().collect();
    if !failed.is_empty() {
        println!();
        println!("{} failed:", failed.len());
        for result in failed {
            let reason = result.reason.as_deref().unwrap_or("unknown error");
            println!("  {}: {}", result.display_name, reason.lines().next().unwrap_or(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_destination() {
        let file = MediaFile::new("/tv/Show/Show - S01E01.mp4");
        assert_eq!(merge_destination(&file, None), PathBuf::from("/tv/Show/Show - S01E01.mkv"));
        assert_eq!(
            merge_destination(&file, Some(Path::new("/tv/Show/Season 01"))),
            PathBuf::from("/tv/Show/Season 01/Show - S01E01.mkv")
        );
    }

    #[test]
    fn test_upload_directory_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Show");
        std::fs::create_dir_all(root.join("Season 01")).unwrap();
        let base = Path::new("/mnt/vault/media/TV");

        assert_eq!(
            upload_directory(base, &root, &root.join("Season 01").join("ep1.mkv")),
            PathBuf::from("/mnt/vault/media/TV/Show/Season 01")
        );
        assert_eq!(
            upload_directory(base, &root.join("extra.mkv"), &root.join("extra.mkv")),
            base.to_path_buf()
        );
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["mediamaint", "-j", "2", "upload", "/media/Show", "--into", "Show"]).unwrap();
        assert_eq!(args.concurrency, Some(2));
        assert!(matches!(args.command, Command::Upload { .. }));

        let args = Args::try_parse_from(["mediamaint", "sync-subs", "movie", "--sub-lang", "fre", "--keep-original"]).unwrap();
        assert!(args.keep_original);
        match args.command {
            Command::SyncSubs { ref_lang, sub_lang, .. } => {
                assert_eq!(ref_lang, "eng");
                assert_eq!(sub_lang.as_deref(), Some("fre"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
