//! Terminal rendering of task trackers.

use std::time::Duration;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::time::MissedTickBehavior;
use crate::tracker::{Tracker, TrackerState};

const RUNNING_TEMPLATE: &str = "{spinner:.green} {prefix:30!} [{bar:40.cyan/blue}] {pos:>3}% {msg}";
const PENDING_TEMPLATE: &str = "  {prefix:30!} [{bar:40.dim}] waiting";
const DONE_TEMPLATE: &str = "✔ {prefix:30!} [{bar:40.green}] {pos:>3}% {msg}";
const ERRORED_TEMPLATE: &str = "✘ {prefix:30!} [{bar:40.red}] {pos:>3}% {msg:.red}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// One bar bound to one tracker
#[derive(Debug)]
pub struct TrackedBar {
    bar: ProgressBar,
    tracker: Tracker,
    last_state: Option<TrackerState>,
}

impl TrackedBar {
    fn is_finished(&self) -> bool {
        self.last_state.map(TrackerState::is_terminal).unwrap_or(false)
    }

    /// Copy the tracker onto the bar; returns true once it is terminal
    fn refresh(&mut self) -> bool {
        if self.is_finished() {
            return true;
        }
        let snapshot = self.tracker.snapshot();
        self.bar.set_position(u64::from(snapshot.value));

        if self.last_state != Some(snapshot.state) {
            match snapshot.state {
                TrackerState::Pending => self.bar.set_style(style(PENDING_TEMPLATE)),
                TrackerState::Running => self.bar.set_style(style(RUNNING_TEMPLATE)),
                TrackerState::Done => {
                    self.bar.set_style(style(DONE_TEMPLATE));
                    self.bar.finish_with_message(snapshot.message.clone());
                }
                TrackerState::Errored => {
                    // Frozen at the last known position.
                    self.bar.set_style(style(ERRORED_TEMPLATE));
                    self.bar.abandon_with_message(first_line(&snapshot.message).to_string());
                }
            }
            self.last_state = Some(snapshot.state);
        }

        if snapshot.state == TrackerState::Running {
            self.bar.set_message(snapshot.message);
            self.bar.tick();
        }
        self.is_finished()
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}

/// Shared progress display for one batch
#[derive(Debug, Clone)]
pub struct ProgressDisplay {
    multi: MultiProgress,
    interval: Duration,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    /// Draw to stderr, refreshing every 100 ms
    pub fn new() -> Self {
        ProgressDisplay {
            multi: MultiProgress::new(),
            interval: Duration::from_millis(100),
        }
    }

    /// Render nothing (tests, non-interactive runs)
    pub fn hidden() -> Self {
        ProgressDisplay {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            interval: Duration::from_millis(100),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run `f` with the bars cleared, so log lines do not tear them
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.multi.suspend(f)
    }

    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.is_hidden() {
            return;
        }
        if let Err(e) = self.multi.println(line) {
            log::debug!("Failed to print above progress bars: {}", e);
        }
    }

    /// Add a bar for `tracker`, labelled with the task's display name
    pub fn add(&self, name: &str, tracker: Tracker) -> TrackedBar {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(style(PENDING_TEMPLATE));
        bar.set_prefix(name.to_string());
        TrackedBar {
            bar,
            tracker,
            last_state: None,
        }
    }

    /// Refresh `bars` until every tracker is terminal
    pub async fn render(&self, mut bars: Vec<TrackedBar>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut active = 0;
            for bar in bars.iter_mut() {
                if !bar.refresh() {
                    active += 1;
                }
            }
            if active == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errored_bar_freezes() {
        let display = ProgressDisplay::hidden();
        let tracker = Tracker::new();
        let mut bar = display.add("movie.mkv", tracker.clone());

        assert!(!bar.refresh());
        tracker.start();
        tracker.set_value(42);
        assert!(!bar.refresh());
        assert_eq!(bar.bar.position(), 42);

        tracker.mark_errored("mkvmerge failed\nSTDERR: boom");
        assert!(bar.refresh());
        assert_eq!(bar.bar.position(), 42);
        assert!(bar.bar.is_finished());
        assert_eq!(bar.bar.message(), "mkvmerge failed");
    }

    #[test]
    fn test_done_bar_is_full() {
        let display = ProgressDisplay::hidden();
        let tracker = Tracker::new();
        let mut bar = display.add("ep1.mkv", tracker.clone());
        tracker.start();
        tracker.mark_done();
        assert!(bar.refresh());
        assert_eq!(bar.bar.position(), 100);
    }

    #[tokio::test]
    async fn test_render_stops_when_all_terminal() {
        let display = ProgressDisplay::hidden().with_interval(Duration::from_millis(5));
        let trackers: Vec<Tracker> = (0..3).map(|_| Tracker::new()).collect();
        let bars = trackers
            .iter()
            .enumerate()
            .map(|(i, t)| display.add(&format!("task {}", i), t.clone()))
            .collect();

        let finisher = {
            let trackers = trackers.clone();
            tokio::spawn(async move {
                for tracker in trackers {
                    tracker.start();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    tracker.mark_done();
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), display.render(bars))
            .await
            .expect("render loop should end once every tracker is terminal");
        finisher.await.unwrap();
    }
}
