//! The daily delivery job: boot run, scheduled runs, overlap guard.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::registry::{TaskFn, TaskRegistry};
use super::schedule::DailySchedule;
use crate::metrics;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Boot,
    Schedule,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Boot => "boot",
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// The task returned an error or panicked.
    Failed(String),
    /// Not run because a previous run was still in flight.
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Snapshot of the job's in-memory state. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub last_trigger: Option<Trigger>,
    pub last_outcome: Option<JobOutcome>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct LastRun {
    trigger: Option<Trigger>,
    outcome: Option<JobOutcome>,
    started_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DailyJob {
    name: String,
    task: TaskFn,
    schedule: DailySchedule,
    in_flight: AtomicBool,
    runs: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    last_run: RwLock<LastRun>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DailyJob {
    /// Create a job without starting it.
    pub fn new(
        name: impl Into<String>,
        task: TaskFn,
        schedule: DailySchedule,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            task,
            schedule,
            in_flight: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_run: RwLock::new(LastRun::default()),
            tracker,
            cancel,
        })
    }

    /// Resolve `task_name` and start the job: one run now, then on schedule.
    ///
    /// Returns `None` (after logging a warning) when the task is not
    /// registered. Nothing is scheduled in that case.
    pub fn start(
        registry: &TaskRegistry,
        task_name: &str,
        schedule: DailySchedule,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        let Some(task) = registry.resolve(task_name) else {
            warn!(
                task = %task_name,
                "Delivery task not available, daily delivery generation disabled"
            );
            return None;
        };

        let job = Self::new(task_name, task, schedule, tracker, cancel);
        info!(task = %job.name, schedule = %job.schedule, "Daily delivery job started");

        job.trigger(Trigger::Boot);
        job.spawn_schedule_loop();

        Some(job)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a run in the background.
    ///
    /// Returns `false` if a previous run is still in flight; the trigger is
    /// then dropped.
    pub fn trigger(self: &Arc<Self>, trigger: Trigger) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            metrics::record_job_run(trigger.as_str(), JobOutcome::Skipped.as_str());
            warn!(task = %self.name, %trigger, "Previous delivery run still in flight, skipping");
            return false;
        }

        let job = Arc::clone(self);
        let span = info_span!("delivery_job", task = %self.name, %trigger);

        self.tracker.spawn(
            async move {
                let _in_flight = InFlight(&job.in_flight);
                job.run(trigger).await;
            }
            .instrument(span),
        );

        true
    }

    /// Trigger a run outside the schedule.
    pub fn run_now(self: &Arc<Self>) -> bool {
        self.trigger(Trigger::Manual)
    }

    pub async fn status(&self) -> JobStatus {
        let last_run = self.last_run.read().await;
        JobStatus {
            last_trigger: last_run.trigger,
            last_outcome: last_run.outcome.clone(),
            last_started_at: last_run.started_at,
            in_flight: self.is_in_flight(),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    async fn run(&self, trigger: Trigger) {
        {
            let mut last_run = self.last_run.write().await;
            last_run.trigger = Some(trigger);
            last_run.started_at = Some(Utc::now());
        }
        self.runs.fetch_add(1, Ordering::Relaxed);

        info!("Generating deliveries");
        let started = Instant::now();

        // Run on its own task so a panic surfaces as a JoinError
        let outcome = match tokio::spawn((self.task)()).await {
            Ok(Ok(())) => {
                info!(elapsed_ms = started.elapsed().as_millis(), "Delivery generation finished");
                JobOutcome::Succeeded
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Delivery generation failed");
                JobOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(error = %e, "Delivery generation panicked");
                JobOutcome::Failed(e.to_string())
            }
        };

        if matches!(outcome, JobOutcome::Failed(_)) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_job_run(trigger.as_str(), outcome.as_str());
        metrics::record_job_duration(started.elapsed().as_secs_f64());

        self.last_run.write().await.outcome = Some(outcome);
    }

    fn spawn_schedule_loop(self: &Arc<Self>) {
        let job = Arc::clone(self);

        self.tracker.spawn(async move {
            let mut last_fired: Option<DateTime<Local>> = None;

            loop {
                let now = Local::now();
                // Never fire the same occurrence twice if the timer wakes early
                let from = match last_fired {
                    Some(last) if last > now => last,
                    _ => now,
                };

                let Some(next) = job.schedule.next_after(&from) else {
                    warn!(schedule = %job.schedule, "Schedule has no upcoming runs");
                    break;
                };

                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(next_run = %next, "Next delivery run scheduled");

                tokio::select! {
                    biased;

                    _ = job.cancel.cancelled() => {
                        debug!("Delivery schedule received cancellation signal");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        last_fired = Some(next);
                        job.trigger(Trigger::Schedule);
                    }
                }
            }

            debug!("Delivery schedule shutting down");
        });
    }
}

impl fmt::Debug for DailyJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DailyJob")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("in_flight", &self.is_in_flight())
            .finish_non_exhaustive()
    }
}
