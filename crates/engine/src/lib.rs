pub mod config;
pub mod display;
pub mod error;
pub mod identify;
pub mod language;
pub mod ledger;
pub mod media;
pub mod placement;
pub mod progress;
pub mod remote;
pub mod scheduler;
pub mod srt;
pub mod task;
pub mod tool;
pub mod tracker;

pub use config::EngineConfig;
pub use display::ProgressDisplay;
pub use error::{BatchFailed, LedgerError, PlacementError, RemoteError, ToolNotFound};
pub use ledger::{BackupLedger, BackupRecord};
pub use media::MediaFile;
pub use placement::PlacementSelector;
pub use remote::{RemoteTransport, SshTransport};
pub use scheduler::{BatchReport, Scheduler, TaskResult};
pub use task::{MergeTask, SubtitleCleanTask, SyncTask, Task, TaskContext, TrackCleanTask, TransferTask};
pub use tracker::{Tracker, TrackerState};
