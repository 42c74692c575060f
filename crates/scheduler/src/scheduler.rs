use crate::job::{JobInfo, JobSchedule, JobState, JobStatus, ScheduleKind};
use chrono::Utc;
use conductor_core::config::SchedulerConfig;
use conductor_core::{Error, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type JobFuture = BoxFuture<'static, Result<()>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct ScheduledJob {
    info: JobInfo,
    run: JobFn,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Millisecond length of `delay` and the wall-clock time it elapses at.
fn fire_time(name: &str, delay: Duration) -> Result<(i64, i64)> {
    let delay_ms = i64::try_from(delay.as_millis()).ok();
    delay_ms
        .and_then(|ms| Utc::now().timestamp_millis().checked_add(ms).map(|at| (ms, at)))
        .ok_or_else(|| Error::Config(format!("Delay of job '{}' is out of range", name)))
}

/// Cooperative periodic-job runner.
///
/// A single loop task wakes every tick, collects due jobs and runs them one
/// after another. A slow job delays the jobs behind it; there is no real-time
/// guarantee. Stopping cancels before the next job starts, never mid-job.
pub struct Scheduler {
    tick: Duration,
    shutdown_timeout: Duration,
    jobs: Mutex<Vec<ScheduledJob>>,
    running: Mutex<Option<LoopHandle>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms.max(1)),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            jobs: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }
    }

    /// Run `job` every `interval`, first one full interval from now.
    pub fn schedule_every<F, Fut>(&self, name: &str, interval: Duration, job: F) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (every_ms, first_ms) = fire_time(name, interval)?;
        if every_ms <= 0 {
            return Err(Error::Config(format!(
                "Interval of job '{}' must be at least 1ms",
                name
            )));
        }
        let run: JobFn = Arc::new(move || -> JobFuture { Box::pin(job()) });
        Ok(self.add_job(name, JobSchedule::every(every_ms), first_ms, run))
    }

    /// Run `job` once after `delay`; the job is removed after it ran.
    pub fn schedule_once<F, Fut>(&self, name: &str, delay: Duration, job: F) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (_, at_ms) = fire_time(name, delay)?;
        let run: JobFn = Arc::new(move || -> JobFuture { Box::pin(job()) });
        Ok(self.add_job(name, JobSchedule::at(at_ms), at_ms, run))
    }

    fn add_job(&self, name: &str, schedule: JobSchedule, next_run_at_ms: i64, run: JobFn) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let info = JobInfo {
            id: id.clone(),
            name: name.to_string(),
            schedule,
            state: JobState {
                next_run_at_ms: Some(next_run_at_ms),
                ..JobState::default()
            },
            created_at_ms: Utc::now().timestamp_millis(),
        };
        debug!(job_id = %id, job_name = %name, next_run_ms = next_run_at_ms, "Job scheduled");
        self.lock_jobs().push(ScheduledJob { info, run });
        id
    }

    /// Remove a job. A run already in progress still completes.
    pub fn cancel(&self, id: &str) -> bool {
        let mut jobs = self.lock_jobs();
        let len_before = jobs.len();
        jobs.retain(|j| j.info.id != id);
        let removed = jobs.len() < len_before;
        if removed {
            debug!(job_id = %id, "Job cancelled");
        }
        removed
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.lock_jobs().iter().map(|j| j.info.clone()).collect()
    }

    pub fn get_job(&self, id: &str) -> Option<JobInfo> {
        self.lock_jobs()
            .iter()
            .find(|j| j.info.id == id)
            .map(|j| j.info.clone())
    }

    /// Run every job that is due now. Returns how many ran.
    pub async fn run_tick(&self) -> usize {
        self.run_due(None).await
    }

    async fn run_due(&self, cancel: Option<&CancellationToken>) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due_ids: Vec<String> = self
            .lock_jobs()
            .iter()
            .filter(|j| j.info.state.next_run_at_ms.is_some_and(|next| next <= now_ms))
            .map(|j| j.info.id.clone())
            .collect();

        let mut ran = 0;
        for id in due_ids {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                debug!("Scheduler stopping, skipping remaining due jobs");
                break;
            }

            // The job may have been cancelled while an earlier one ran.
            let claimed = {
                let mut jobs = self.lock_jobs();
                jobs.iter_mut().find(|j| j.info.id == id).map(|job| {
                    let started_ms = Utc::now().timestamp_millis();
                    job.info.state.last_run_at_ms = Some(started_ms);
                    job.info.state.next_run_at_ms = match job.info.schedule.kind {
                        ScheduleKind::Every => job
                            .info
                            .schedule
                            .every_ms
                            .map(|every| started_ms.saturating_add(every)),
                        ScheduleKind::At => None,
                    };
                    (job.info.name.clone(), job.run.clone())
                })
            };

            if let Some((name, run)) = claimed {
                self.execute(&id, &name, run).await;
                ran += 1;
            }
        }
        ran
    }

    async fn execute(&self, id: &str, name: &str, run: JobFn) {
        debug!(job_id = %id, job_name = %name, "Executing scheduled job");
        let started = Instant::now();

        // Spawned so a panicking job surfaces as a JoinError instead of
        // unwinding through the loop.
        let outcome = match tokio::spawn((run)()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err("job panicked".to_string()),
            Err(e) => Err(e.to_string()),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(err) = &outcome {
            error!(job_id = %id, job_name = %name, error = %err, "Scheduled job failed");
        }

        let mut jobs = self.lock_jobs();
        if let Some(pos) = jobs.iter().position(|j| j.info.id == id) {
            let state = &mut jobs[pos].info.state;
            state.run_count += 1;
            state.last_duration_ms = Some(elapsed_ms);
            match outcome {
                Ok(()) => {
                    state.last_status = Some(JobStatus::Ok);
                    state.last_error = None;
                }
                Err(err) => {
                    state.last_status = Some(JobStatus::Error);
                    state.last_error = Some(err);
                }
            }
            if jobs[pos].info.schedule.kind == ScheduleKind::At {
                jobs.remove(pos);
            }
        }
    }

    /// Spawn the loop task. Calling it while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!("Scheduler already running");
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_loop(cancel.clone()));
        *running = Some(LoopHandle { cancel, handle });
    }

    /// Stop the loop and wait for an in-flight job, bounded by the shutdown
    /// timeout. A job still running past the timeout is abandoned, not killed.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(LoopHandle { cancel, handle }) = running else {
            debug!("Scheduler not running");
            return;
        };

        cancel.cancel();
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => info!("Scheduler stopped"),
            Ok(Err(e)) => warn!(error = %e, "Scheduler loop ended abnormally"),
            Err(_) => warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Scheduler stop timed out, abandoning in-flight job"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.run_due(Some(&cancel)).await;
                }
            }
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}
