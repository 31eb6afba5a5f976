//! The per-instance event loop.
//!
//! One task owns every registry mutation triggered by scheduler-level
//! events: poll ticks, timer completions, change notifications and the
//! shutdown signal. Events are handled one at a time.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use watchpost_core::config::SchedulerConfig;
use watchpost_core::{Job, Recurrence};
use watchpost_storage::SchedulerStorage;

use crate::callbacks::Callbacks;
use crate::dump::write_dump;
use crate::registry::{LiveJob, Registry};
use crate::timer::{self, Completion};

const UPDATE_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub instance: String,
    pub state: SchedulerState,
    pub claimed_jobs: usize,
    pub max_jobs: usize,
    pub started_at: Option<DateTime<Utc>>,
}

struct Shared {
    instance: String,
    registry: Registry,
    state: watch::Sender<SchedulerState>,
    started_at: OnceLock<DateTime<Utc>>,
}

/// Read-only handle on a scheduler that may be running on another task.
#[derive(Clone)]
pub struct SchedulerMonitor {
    shared: Arc<Shared>,
}

impl SchedulerMonitor {
    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            instance: self.shared.instance.clone(),
            state: self.state(),
            claimed_jobs: self.shared.registry.len(),
            max_jobs: self.shared.registry.capacity(),
            started_at: self.shared.started_at.get().copied(),
        }
    }

    /// Resolves once the scheduler reaches `state`.
    pub async fn wait_for(&self, state: SchedulerState) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// The registry's copy of a job, if this instance owns it.
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.shared.registry.get(id)
    }

    pub fn claimed_ids(&self) -> Vec<Uuid> {
        self.shared.registry.ids()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    storage: Arc<dyn SchedulerStorage>,
    callbacks: Callbacks,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<dyn SchedulerStorage>,
        callbacks: Callbacks,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Initializing);
        let shared = Arc::new(Shared {
            instance: storage.instance_name().to_string(),
            registry: Registry::new(config.max_jobs),
            state,
            started_at: OnceLock::new(),
        });
        Self {
            config,
            storage,
            callbacks,
            shared,
        }
    }

    pub fn monitor(&self) -> SchedulerMonitor {
        SchedulerMonitor {
            shared: self.shared.clone(),
        }
    }

    fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.shared.state.send_replace(state);
        info!(instance = %self.shared.instance, from = ?previous, to = ?state, "scheduler state changed");
    }

    /// Claim jobs, run them until `shutdown` resolves, then drain.
    ///
    /// Returns the process exit code: `0` after a clean release, `1` when
    /// the release failed and a recovery dump was attempted instead.
    pub async fn start<F>(self, shutdown: F) -> i32
    where
        F: Future<Output = ()> + Send,
    {
        let (completion_tx, mut completion_rx) =
            mpsc::channel::<Completion>(self.config.max_jobs.clamp(16, 4096));
        let (change_tx, mut change_rx) = mpsc::channel::<Uuid>(UPDATE_QUEUE);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Subscribe before claiming so no edit to a freshly claimed job is missed.
        if let Err(e) = self.storage.listen_for_changes(change_tx, cancel_rx).await {
            error!(error = %e, "could not subscribe to job changes, updates will not be applied live");
        }
        self.claim_and_schedule(&completion_tx).await;

        let _ = self.shared.started_at.set(Utc::now());
        self.set_state(SchedulerState::Running);

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                _ = ticker.tick() => self.claim_and_schedule(&completion_tx).await,
                Some(completion) = completion_rx.recv() => self.on_completion(completion, &completion_tx).await,
                Some(id) = change_rx.recv() => self.refresh(id, &completion_tx).await,
            }
        }

        self.drain(cancel_tx, completion_tx, completion_rx).await
    }

    /// Fill free capacity with unclaimed jobs and start their timers.
    async fn claim_and_schedule(&self, completions: &mpsc::Sender<Completion>) {
        let space = self.registry().available_space();
        if space == 0 {
            debug!("no more space in registry, skipping claim");
            return;
        }

        let jobs = match self.storage.available_jobs(space).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "claiming jobs failed");
                return;
            }
        };
        if jobs.is_empty() {
            debug!("no jobs waiting to be claimed");
            return;
        }

        let claimed = jobs.len();
        let mut refused = Vec::new();
        for job in jobs {
            let recurrence = match schedulable(&job.cron_expression) {
                Ok(r) => r,
                Err(reason) => {
                    warn!(job_id = %job.id, error = %reason, "invalid recurrence, setting job aside");
                    if let Err(e) = self.storage.mark_invalid(job.id, &reason).await {
                        warn!(job_id = %job.id, error = %e, "marking job invalid failed");
                    }
                    continue;
                }
            };
            let id = job.id;
            match self.registry().insert(LiveJob::new(job, recurrence)) {
                Ok(()) => self.schedule(id, completions),
                Err(live) => refused.push(live.job.id),
            }
        }

        if !refused.is_empty() {
            warn!(count = refused.len(), "registry refused claimed jobs, releasing them");
            if let Err(e) = self.storage.release_all(&refused).await {
                warn!(error = %e, "releasing refused jobs failed");
            }
        }
        info!(
            claimed,
            registry = self.registry().len(),
            capacity = self.registry().capacity(),
            "jobs claimed"
        );
    }

    /// Start a fresh timer task for `id`, superseding any previous one.
    fn schedule(&self, id: Uuid, completions: &mpsc::Sender<Completion>) {
        match self.registry().arm(id) {
            Some(armed) => timer::spawn(armed, self.callbacks.clone(), completions.clone()),
            None => debug!(job_id = %id, "job left the registry before it could be scheduled"),
        }
    }

    async fn on_completion(&self, completion: Completion, completions: &mpsc::Sender<Completion>) {
        let current = self.registry().with_job(completion.job_id, |live| {
            live.job.copy_outcome_from(&completion.job);
            live.generation() == completion.generation
        });
        match current {
            Some(true) if completion.exhausted => self.set_aside(completion.job_id).await,
            Some(true) => self.schedule(completion.job_id, completions),
            Some(false) => debug!(
                job_id = %completion.job_id,
                generation = completion.generation,
                "superseded timer finished, not rescheduling"
            ),
            None => debug!(job_id = %completion.job_id, "completion for a job no longer owned"),
        }
    }

    /// Drop a job whose recurrence ran out and hand it back as invalid.
    async fn set_aside(&self, id: Uuid) {
        let Some(live) = self.registry().remove(id) else {
            return;
        };
        let reason = format!("'{}': no future occurrences", live.recurrence.expression());
        info!(job_id = %id, "recurrence exhausted, setting job aside");
        if let Err(e) = self.storage.mark_invalid(id, &reason).await {
            warn!(job_id = %id, error = %e, "marking job invalid failed");
        }
    }

    /// Apply the job's current stored fields and restart its timer.
    async fn refresh(&self, id: Uuid, completions: &mpsc::Sender<Completion>) {
        if !self.registry().contains(id) {
            debug!(job_id = %id, "change notification for a job not owned here");
            return;
        }

        let updates = match self.storage.job_updates(id).await {
            Ok(Some(updates)) => updates,
            Ok(None) => {
                self.registry().abort(id);
                self.registry().remove(id);
                info!(job_id = %id, "job deleted, removed from registry");
                return;
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "fetching job updates failed, keeping current fields");
                return;
            }
        };

        let recurrence = match schedulable(&updates.cron_expression) {
            Ok(r) => Some(r),
            Err(reason) => {
                warn!(job_id = %id, error = %reason, "updated recurrence is invalid, keeping the previous one");
                None
            }
        };

        self.registry().abort(id);
        let applied = self.registry().with_job(id, |live| {
            let previous = live.job.cron_expression.clone();
            live.job.apply_updates(&updates);
            match recurrence {
                Some(r) => live.recurrence = r,
                None => live.job.cron_expression = previous,
            }
        });
        if applied.is_some() {
            info!(job_id = %id, endpoint = %updates.endpoint, "job updated");
            self.schedule(id, completions);
        }
    }

    async fn drain(
        self,
        cancel_listener: watch::Sender<bool>,
        completion_tx: mpsc::Sender<Completion>,
        mut completion_rx: mpsc::Receiver<Completion>,
    ) -> i32 {
        self.set_state(SchedulerState::Draining);

        let _ = cancel_listener.send(true);
        if let Err(e) = self.storage.stop_listening_for_changes().await {
            warn!(error = %e, "stopping change listener failed");
        }

        let aborted = self.registry().abort_all();
        debug!(aborted, "waiting timers aborted");

        // Timers that were mid-execution still hold a sender; wait for them
        // so their write-backs land while the jobs are still ours.
        drop(completion_tx);
        let deadline = Instant::now() + self.config.drain_grace;
        let mut late = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, completion_rx.recv()).await {
                Ok(Some(completion)) => {
                    late += 1;
                    self.registry().with_job(completion.job_id, |live| {
                        live.job.copy_outcome_from(&completion.job);
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        grace_ms = self.config.drain_grace.as_millis() as u64,
                        "in-flight executions did not finish within the drain grace period"
                    );
                    break;
                }
            }
        }
        debug!(late, "in-flight completions drained");

        let jobs = self.registry().snapshot();
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let code = match self.storage.release_all(&ids).await {
            Ok(()) => {
                info!(released = ids.len(), "claimed jobs released");
                0
            }
            Err(e) => {
                error!(error = %e, jobs = ids.len(), "releasing jobs failed, writing recovery dump");
                if let Err(e) = write_dump(&self.config.dump_path, &jobs) {
                    error!(
                        path = %self.config.dump_path.display(),
                        error = %e,
                        "writing recovery dump failed"
                    );
                }
                1
            }
        };

        self.registry().clear();
        self.set_state(SchedulerState::Stopped);
        code
    }
}

/// Compile `expression` and require at least one future fire time.
fn schedulable(expression: &str) -> Result<Recurrence, String> {
    let recurrence = Recurrence::parse(expression).map_err(|e| e.to_string())?;
    if recurrence.next_after(Utc::now()).is_none() {
        return Err(format!("'{}': no future occurrences", recurrence.expression()));
    }
    Ok(recurrence)
}
