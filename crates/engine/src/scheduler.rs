//! Bounded execution of a batch of tasks.
//!
//! Every task gets its own tracker and runs to completion regardless of how
//! its siblings fare; at most `concurrency` of them hold a permit (and thus
//! a `Running` tracker) at any moment. Results are collected under one mutex
//! and returned sorted by display name.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use crate::config::EngineConfig;
use crate::display::ProgressDisplay;
use crate::error::BatchFailed;
use crate::task::{Characteristics, Task, TaskContext};
use crate::tool::OutputSink;
use crate::tracker::Tracker;

/// Outcome of one task
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub display_name: String,
    pub is_successful: bool,
    /// Task-reported facts plus `duration`
    pub characteristics: Characteristics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Failure message with its full context chain
    pub reason: Option<String>,
}

/// Sorted results of a whole batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<TaskResult>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| !r.is_successful)
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Single aggregate error when anything failed
    pub fn check(&self) -> Result<(), BatchFailed> {
        let failed = self.failed().count();
        if failed > 0 {
            return Err(BatchFailed {
                failed,
                total: self.results.len(),
            });
        }
        Ok(())
    }
}

/// Human-readable duration (`4.2s`, `3m 07s`, `1h 02m 09s`)
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = secs / 60 % 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Runs batches of tasks under a concurrency ceiling
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<EngineConfig>,
    concurrency: usize,
    cancel: CancellationToken,
    output: Option<OutputSink>,
    display: Option<ProgressDisplay>,
}

impl Scheduler {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let concurrency = config.concurrency.max(1);
        Scheduler {
            config,
            concurrency,
            cancel: CancellationToken::new(),
            output: None,
            display: None,
        }
    }

    /// Share a cancellation token (e.g. one fired on Ctrl-C)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mirror every tool's stdout into `sink`
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn with_display(mut self, display: ProgressDisplay) -> Self {
        self.display = Some(display);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every task and return their results sorted by display name
    pub async fn run(&self, tasks: Vec<Box<dyn Task>>) -> BatchReport {
        let total = tasks.len();
        info!("Running {} task(s), at most {} at a time", total, self.concurrency);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let results = Arc::new(Mutex::new(Vec::with_capacity(total)));
        let mut bars = Vec::new();
        let mut set = JoinSet::new();

        for mut task in tasks {
            let tracker = Tracker::new();
            task.attach_tracker(tracker.clone());
            if let Some(sink) = &self.output {
                task.attach_output(sink.clone());
            }
            if let Some(display) = &self.display {
                bars.push(display.add(task.display_name(), tracker.clone()));
            }

            let ctx = TaskContext::new(self.config.clone(), self.cancel.clone());
            set.spawn(run_one(task, tracker, ctx, semaphore.clone(), results.clone()));
        }

        let render = self.display.clone().map(|display| tokio::spawn(async move { display.render(bars).await }));

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Task runner ended abnormally: {}", e);
            }
        }
        if let Some(render) = render {
            if let Err(e) = render.await {
                debug!("Progress display ended abnormally: {}", e);
            }
        }

        let mut results = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        results.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        let failed = results.iter().filter(|r| !r.is_successful).count();
        if failed > 0 {
            warn!("{} of {} task(s) failed", failed, total);
        } else {
            info!("All {} task(s) succeeded", total);
        }
        BatchReport { results }
    }
}

async fn run_one(
    mut task: Box<dyn Task>,
    tracker: Tracker,
    ctx: TaskContext,
    semaphore: Arc<Semaphore>,
    results: Arc<Mutex<Vec<TaskResult>>>,
) {
    let display_name = task.display_name().to_string();
    let cancel = ctx.cancel.clone();

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };

    let started_at = Utc::now();
    let clock = Instant::now();
    let (outcome, finished_at) = match permit {
        None => (Err("cancelled".to_string()), Utc::now()),
        Some(permit) => {
            tracker.start();
            debug!("{}: started", display_name);

            // Own tokio task, so a panic is caught as a failed result.
            let handle = tokio::spawn(async move { task.run(&ctx).await });
            let outcome = match handle.await {
                Ok(Ok(characteristics)) => Ok(characteristics),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) if e.is_panic() => Err("task panicked".to_string()),
                Err(e) => Err(format!("task did not complete: {}", e)),
            };
            // Terminal before the permit is released.
            settle(&tracker, &outcome);
            let finished_at = Utc::now();
            drop(permit);
            (outcome, finished_at)
        }
    };
    settle(&tracker, &outcome);
    let elapsed = clock.elapsed();

    let mut characteristics = Characteristics::new();
    let (is_successful, reason) = match outcome {
        Ok(reported) => {
            info!("{}: done in {}", display_name, format_duration(elapsed));
            characteristics = reported;
            (true, None)
        }
        Err(reason) => {
            error!("{}: {}", display_name, reason);
            (false, Some(reason))
        }
    };
    characteristics.insert("duration".to_string(), format_duration(elapsed));

    let result = TaskResult {
        display_name,
        is_successful,
        characteristics,
        started_at,
        finished_at,
        reason,
    };

    results.lock().unwrap_or_else(PoisonError::into_inner).push(result);
}

/// Move the tracker to its terminal state; later calls are no-ops
fn settle(tracker: &Tracker, outcome: &Result<Characteristics, String>) {
    match outcome {
        Ok(_) => tracker.mark_done(),
        Err(reason) => tracker.mark_errored(reason.clone()),
    }
}
