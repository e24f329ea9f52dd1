//! Progress extraction from the unstructured output of external tools.
//!
//! Tools write progress to stdout without reliable line breaks (rsync and
//! mkvmerge redraw with `\r`). The pipe reader appends raw bytes to an
//! [`OutputBuffer`]; a poller drains the buffer on a fixed interval and
//! matches the drained text against a per-tool [`ProgressPattern`]. Only the
//! last match of a window counts, and only complete `\r`/`\n` terminated
//! segments are matched while the tool is still writing.

use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::tracker::Tracker;

macro_rules! regex {
    ($name:ident, $regex:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($regex).unwrap());
    };
}

regex!(MERGE_REGEX, r"(?i)progress:?\s+(\d+)%");
regex!(TRANSFER_REGEX, r"(\d+)%");
regex!(
    SYNC_REGEX,
    r"(?i)progress\s+(\d+(?:\.\d+)?)%(?:[^\r\n]*?correlation=(\d+(?:\.\d+)?))?"
);

/// One progress observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    pub percent: u8,
    /// Secondary metric reported on the same line (e.g. a sync quality score)
    pub auxiliary: Option<f64>,
}

/// Regex describing where a tool prints its percentage.
///
/// Group 1 is the percentage, optional group 2 the auxiliary metric.
#[derive(Debug, Clone)]
pub struct ProgressPattern {
    regex: Regex,
}

impl ProgressPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(ProgressPattern {
            regex: Regex::new(pattern)?,
        })
    }

    /// mkvmerge: `Progress: 45%` (or `#GUI#progress 45%` in GUI mode)
    pub fn merge() -> Self {
        ProgressPattern {
            regex: MERGE_REGEX.clone(),
        }
    }

    /// rsync `--info=progress2`: a bare percentage column
    pub fn transfer() -> Self {
        ProgressPattern {
            regex: TRANSFER_REGEX.clone(),
        }
    }

    /// subsync: `progress 45.30%, 120 points, correlation=97.12%`
    pub fn sync() -> Self {
        ProgressPattern {
            regex: SYNC_REGEX.clone(),
        }
    }

    /// Extract the last reading in `text`.
    ///
    /// A malformed last match (unparsable or above 100) yields `None`, it never
    /// falls back to an earlier match.
    pub fn extract(&self, text: &str) -> Option<ProgressReading> {
        let caps = self.regex.captures_iter(text).last()?;
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        if !(0.0..=100.0).contains(&percent) {
            return None;
        }
        let auxiliary = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
        Some(ProgressReading {
            percent: percent.floor() as u8,
            auxiliary,
        })
    }
}

/// Byte buffer shared between a pipe reader and a poller.
///
/// Guarded by a mutex: appends and drains never interleave, so a poll sees
/// either all or none of a chunk.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// Take everything written since the last drain
    pub fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.bytes.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Take everything up to and including the last `\r` or `\n`.
    ///
    /// An unterminated tail stays buffered for the next call.
    pub fn drain_complete(&self) -> String {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(end) = bytes.iter().rposition(|b| *b == b'\r' || *b == b'\n') else {
            return String::new();
        };
        let complete: Vec<u8> = bytes.drain(..=end).collect();
        String::from_utf8_lossy(&complete).into_owned()
    }
}

/// Anything that can be asked for the latest progress reading.
///
/// The buffered pattern matcher is the only implementation today; a tool with
/// structured progress events can plug in here without touching the tasks.
pub trait ProgressSource: Send {
    fn poll(&mut self) -> Option<ProgressReading>;

    /// Last read once the tool has exited
    fn flush(&mut self) -> Option<ProgressReading> {
        self.poll()
    }
}

/// Progress source matching a pattern against a drained [`OutputBuffer`]
#[derive(Debug)]
pub struct BufferedSource {
    buffer: OutputBuffer,
    pattern: ProgressPattern,
}

impl BufferedSource {
    pub fn new(buffer: OutputBuffer, pattern: ProgressPattern) -> Self {
        BufferedSource { buffer, pattern }
    }
}

impl ProgressSource for BufferedSource {
    fn poll(&mut self) -> Option<ProgressReading> {
        let text = self.buffer.drain_complete();
        if text.is_empty() {
            return None;
        }
        self.pattern.extract(&text)
    }

    fn flush(&mut self) -> Option<ProgressReading> {
        let text = self.buffer.drain();
        if text.is_empty() {
            return None;
        }
        self.pattern.extract(&text)
    }
}

/// How a poller translates readings into tracker writes
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    /// Range the rendered value is held within while the tool runs
    pub clamp: Option<RangeInclusive<u8>>,
    /// Label for the auxiliary metric in the tracker message
    pub auxiliary_label: Option<&'static str>,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        PollOptions {
            interval,
            clamp: None,
            auxiliary_label: None,
        }
    }

    pub fn clamped(mut self, range: RangeInclusive<u8>) -> Self {
        self.clamp = Some(range);
        self
    }

    pub fn with_auxiliary_label(mut self, label: &'static str) -> Self {
        self.auxiliary_label = Some(label);
        self
    }
}

/// Handle on a running poller. Dropping it aborts the loop.
#[derive(Debug)]
pub struct PollerHandle {
    stop: CancellationToken,
    handle: JoinHandle<Option<ProgressReading>>,
}

impl PollerHandle {
    /// Stop polling after one final read and return the last reading seen
    pub async fn finish(mut self) -> Option<ProgressReading> {
        self.stop.cancel();
        (&mut self.handle).await.ok().flatten()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start polling `source` into `tracker`.
///
/// Returns `None` without spawning anything when there is no tracker, so a
/// task that was never given one cannot leave an orphaned loop behind. The
/// loop also exits on its own once the tracker turns terminal.
pub fn spawn_poller<S>(tracker: Option<&Tracker>, mut source: S, options: PollOptions) -> Option<PollerHandle>
where
    S: ProgressSource + 'static,
{
    let tracker = tracker?.clone();
    let stop = CancellationToken::new();
    let token = stop.clone();

    let handle = tokio::spawn(async move {
        let mut last: Option<ProgressReading> = None;
        let mut ticker = tokio::time::interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if tracker.is_terminal() {
                return last;
            }
            apply_reading(&tracker, source.poll(), &options, &mut last);
        }

        // The tool has exited; pick up whatever it printed last.
        if !tracker.is_terminal() {
            apply_reading(&tracker, source.flush(), &options, &mut last);
        }
        last
    });

    Some(PollerHandle { stop, handle })
}

fn apply_reading(
    tracker: &Tracker,
    reading: Option<ProgressReading>,
    options: &PollOptions,
    last: &mut Option<ProgressReading>,
) {
    let Some(reading) = reading else {
        return;
    };

    let value = match &options.clamp {
        Some(range) => reading.percent.clamp(*range.start(), *range.end()),
        None => reading.percent,
    };
    tracker.set_value(value);

    let auxiliary = reading.auxiliary.or(last.and_then(|r| r.auxiliary));
    if let (Some(label), Some(aux)) = (options.auxiliary_label, reading.auxiliary) {
        tracker.set_message(format!("{} {:.2}", label, aux));
    }
    *last = Some(ProgressReading {
        percent: reading.percent,
        auxiliary,
    });
}
