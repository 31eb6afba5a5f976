//! Capacity-bounded map of the jobs this instance owns.
//!
//! Only the scheduler's event loop inserts and removes entries. Timer tasks
//! work on their own copy of the job and never touch the map.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use uuid::Uuid;

use watchpost_core::{Job, Recurrence};

/// A claimed job plus the runtime state of its timer task.
#[derive(Debug)]
pub struct LiveJob {
    pub job: Job,
    pub recurrence: Recurrence,
    /// Bumped every time a new timer task is started for the job.
    generation: u64,
    /// Present while a timer task may be waiting; taken when it is signalled.
    abort: Option<oneshot::Sender<()>>,
}

impl LiveJob {
    pub fn new(job: Job, recurrence: Recurrence) -> Self {
        Self {
            job,
            recurrence,
            generation: 0,
            abort: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a timer task has been started and not yet aborted.
    pub fn is_scheduled(&self) -> bool {
        self.abort.is_some()
    }
}

/// What a new timer task needs, handed out by [`Registry::arm`].
pub struct Armed {
    pub job: Job,
    pub recurrence: Recurrence,
    pub generation: u64,
    pub abort: oneshot::Receiver<()>,
}

pub struct Registry {
    capacity: usize,
    jobs: Mutex<HashMap<Uuid, LiveJob>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
        }
    }

    // The map only holds plain data, so a panic elsewhere cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, LiveJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Capacity minus current size.
    pub fn available_space(&self) -> usize {
        self.capacity.saturating_sub(self.lock().len())
    }

    /// Insert unless the registry is full or already holds the id.
    /// Hands the entry back on refusal.
    pub fn insert(&self, live: LiveJob) -> Result<(), LiveJob> {
        let mut jobs = self.lock();
        if jobs.len() >= self.capacity || jobs.contains_key(&live.job.id) {
            return Err(live);
        }
        jobs.insert(live.job.id, live);
        Ok(())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    /// Copy of the job's current data.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).map(|l| l.job.clone())
    }

    /// Remove the entry. Dropping its abort token cancels a waiting timer task.
    pub fn remove(&self, id: Uuid) -> Option<LiveJob> {
        self.lock().remove(&id)
    }

    /// Run `f` on the entry under the lock.
    pub fn with_job<R>(&self, id: Uuid, f: impl FnOnce(&mut LiveJob) -> R) -> Option<R> {
        self.lock().get_mut(&id).map(f)
    }

    /// Visit every entry under the lock.
    pub fn for_each(&self, mut f: impl FnMut(&LiveJob)) {
        for live in self.lock().values() {
            f(live);
        }
    }

    /// Copies of every job.
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.capacity.min(1024));
        self.for_each(|live| jobs.push(live.job.clone()));
        jobs
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    /// Prepare a new timer task for `id`: bump the generation and install a
    /// fresh abort token, dropping any previous one.
    pub fn arm(&self, id: Uuid) -> Option<Armed> {
        let mut jobs = self.lock();
        let live = jobs.get_mut(&id)?;
        let (tx, rx) = oneshot::channel();
        live.generation += 1;
        live.abort = Some(tx);
        Some(Armed {
            job: live.job.clone(),
            recurrence: live.recurrence.clone(),
            generation: live.generation,
            abort: rx,
        })
    }

    /// Signal the job's abort token. Each token is signalled at most once;
    /// returns `false` if there was nothing left to signal.
    pub fn abort(&self, id: Uuid) -> bool {
        self.lock()
            .get_mut(&id)
            .and_then(|live| live.abort.take())
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Signal every outstanding abort token, returning how many reached a
    /// task that was still waiting.
    pub fn abort_all(&self) -> usize {
        let mut delivered = 0;
        for live in self.lock().values_mut() {
            if let Some(tx) = live.abort.take() {
                if tx.send(()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
