//! In-process claim layer.
//!
//! A [`MemoryBackend`] plays the role of the shared table; every
//! [`MemoryStorage`] handle attached to it behaves like one scheduler
//! instance. All state sits behind one lock, which gives claims the same
//! exclusivity the row locks give in PostgreSQL. The backend can be taken
//! offline to exercise storage-failure paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use watchpost_core::{Job, JobExecution, JobStatus, JobUpdates};

use crate::error::StorageError;
use crate::traits::{
    cancelled, forward_payload, Flow, JobAdmin, JobPatch, NewJob, SchedulerStorage,
    RELEASE_PAYLOAD,
};

#[derive(Default)]
struct State {
    /// Insertion order doubles as `created_at` order.
    jobs: Vec<Job>,
    executions: Vec<JobExecution>,
    /// Channel name → payload sender of the instance listening on it.
    channels: HashMap<String, mpsc::UnboundedSender<String>>,
    offline: bool,
}

impl State {
    fn online(&self) -> Result<(), StorageError> {
        if self.offline {
            Err(StorageError::Unavailable("memory backend is offline".into()))
        } else {
            Ok(())
        }
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// `NOTIFY` semantics: dropped when nobody listens.
    fn notify(&mut self, channel: &str, payload: String) {
        if let Some(tx) = self.channels.get(channel) {
            if tx.send(payload).is_err() {
                self.channels.remove(channel);
            }
        }
    }
}

/// Shared job table for [`MemoryStorage`] handles.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle acting as the scheduler instance `instance`.
    pub fn storage(&self, instance: impl Into<String>) -> MemoryStorage {
        MemoryStorage {
            backend: self.clone(),
            instance: instance.into(),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Insert a job row as-is.
    pub fn insert(&self, job: Job) {
        self.lock().jobs.push(job);
    }

    /// Make every operation fail with [`StorageError::Unavailable`] (or recover).
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Snapshot of every job row.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Every execution recorded for `job_id`, oldest first.
    pub fn executions_for(&self, job_id: Uuid) -> Vec<JobExecution> {
        self.lock()
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Publish `payload` on `channel`.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) {
        self.lock().notify(channel, payload.into());
    }
}

struct ListenerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One scheduler instance's view of a [`MemoryBackend`].
pub struct MemoryStorage {
    backend: MemoryBackend,
    instance: String,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
}

impl MemoryStorage {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl SchedulerStorage for MemoryStorage {
    fn instance_name(&self) -> &str {
        &self.instance
    }

    async fn available_jobs(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        let claimed: Vec<Job> = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::PendingToBeClaimed)
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Claimed;
                job.claimed_by = Some(self.instance.clone());
                job.clone()
            })
            .collect();
        debug!(instance = %self.instance, claimed = claimed.len(), "memory claim");
        Ok(claimed)
    }

    async fn release_all(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        let mut released = 0usize;
        for job in state.jobs.iter_mut() {
            if ids.contains(&job.id) && job.claimed_by.as_deref() == Some(self.instance.as_str()) {
                job.claimed_by = None;
                job.status = JobStatus::PendingToBeClaimed;
                released += 1;
            }
        }
        info!(requested = ids.len(), released, "jobs released");
        Ok(())
    }

    async fn job_updates(&self, id: Uuid) -> Result<Option<JobUpdates>, StorageError> {
        let state = self.backend.lock();
        state.online()?;
        Ok(state.jobs.iter().find(|j| j.id == id).map(JobUpdates::from))
    }

    async fn listen_for_changes(
        &self,
        sink: mpsc::Sender<Uuid>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), StorageError> {
        let mut guard = self.listener.lock().await;
        if let Some(previous) = guard.take() {
            let _ = previous.stop.send(());
            previous.task.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.backend.lock();
            state.online()?;
            state.channels.insert(self.instance.clone(), tx);
        }

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen_loop(
            self.backend.clone(),
            self.instance.clone(),
            rx,
            sink,
            cancel,
            stop_rx,
        ));
        *guard = Some(ListenerHandle { stop, task });
        Ok(())
    }

    async fn stop_listening_for_changes(&self) -> Result<(), StorageError> {
        let Some(handle) = self.listener.lock().await.take() else {
            return Ok(());
        };
        let _ = handle.stop.send(());
        handle
            .task
            .await
            .map_err(|e| StorageError::Listener(e.to_string()))
    }

    async fn write_done(&self, job: &Job, execution: &JobExecution) -> Result<(), StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        let row = state.find_mut(job.id).ok_or(StorageError::NotFound(job.id))?;
        if row.claimed_by.as_deref() == Some(self.instance.as_str()) {
            row.should_execute_at = job.should_execute_at;
            row.last_execution = job.last_execution;
            row.last_response_at = job.last_response_at;
            row.last_message = job.last_message.clone();
            row.last_status_code = job.last_status_code;
            row.succeeded = job.succeeded;
        }
        state.executions.push(execution.clone());
        Ok(())
    }

    async fn mark_invalid(&self, id: Uuid, reason: &str) -> Result<(), StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        if let Some(row) = state.find_mut(id) {
            if row.claimed_by.as_deref() == Some(self.instance.as_str()) {
                row.status = JobStatus::InvalidRecurrence;
                row.claimed_by = None;
                row.last_message = Some(reason.to_string());
            }
        }
        Ok(())
    }
}

async fn listen_loop(
    backend: MemoryBackend,
    channel: String,
    mut payloads: mpsc::UnboundedReceiver<String>,
    sink: mpsc::Sender<Uuid>,
    mut cancel: watch::Receiver<bool>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = &mut stop => break,
            received = payloads.recv() => match received {
                Some(payload) => {
                    if forward_payload(&channel, &payload, &sink).await == Flow::Stop {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    backend.lock().channels.remove(&channel);
}

#[async_trait]
impl JobAdmin for MemoryStorage {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StorageError> {
        let job = new_job.into_job(Uuid::new_v4());
        let mut state = self.backend.lock();
        state.online()?;
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let state = self.backend.lock();
        state.online()?;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>, StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        let Some(row) = state.find_mut(id) else {
            return Ok(None);
        };
        patch.apply(row);
        let job = row.clone();
        if let Some(owner) = &job.claimed_by {
            state.notify(owner, id.to_string());
        }
        Ok(Some(job))
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        let Some(pos) = state.jobs.iter().position(|j| j.id == id) else {
            return Ok(false);
        };
        let job = state.jobs.remove(pos);
        state.executions.retain(|e| e.job_id != id);
        if let Some(owner) = &job.claimed_by {
            state.notify(owner, id.to_string());
        }
        Ok(true)
    }

    async fn claimed_jobs(
        &self,
        instance: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StorageError> {
        let state = self.backend.lock();
        state.online()?;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.claimed_by.as_deref() == Some(instance))
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn executions(
        &self,
        job_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobExecution>, StorageError> {
        let state = self.backend.lock();
        state.online()?;
        Ok(state
            .executions
            .iter()
            .rev()
            .filter(|e| e.job_id == job_id)
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn notify_release(&self, instance: &str) -> Result<(), StorageError> {
        let mut state = self.backend.lock();
        state.online()?;
        state.notify(instance, RELEASE_PAYLOAD.to_string());
        Ok(())
    }
}
