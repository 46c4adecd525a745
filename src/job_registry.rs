// jobsentry: authoritative set of live jobs

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use crate::error::AgentError;
use crate::model::{Job, JobEvent};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type LifecycleCallback = Box<dyn Fn(JobEvent, &Job) + Send + Sync>;

/// `true` if the process is still running, via a null-signal send.
pub fn is_process_running(pid: i32) -> bool {
    // A zero signal performs no action but still validates pid existence
    // and permissions; ESRCH means the process is gone.
    unsafe { libc::kill(pid, 0) == 0 }
}

struct Inner {
    jobs: RwLock<HashMap<i64, Job>>,
    callbacks: RwLock<Vec<LifecycleCallback>>,
}

/// Reader-preferring shared-lock registry of live jobs. Mutations release
/// the lock before invoking lifecycle callbacks, so a subscriber may safely
/// call back into the registry without deadlocking.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(JobEvent, &Job) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .expect("job registry callback list poisoned")
            .push(Box::new(callback));
    }

    fn notify(&self, event: JobEvent, job: &Job) {
        let callbacks = self.inner.callbacks.read().expect("job registry callback list poisoned");
        for cb in callbacks.iter() {
            cb(event, job);
        }
    }

    pub fn add(&self, job: Job) -> Result<(), AgentError> {
        if job.pids.is_empty() {
            return Err(AgentError::JobEmptyPids(job.id));
        }
        {
            let mut jobs = self.inner.jobs.write().expect("job registry map poisoned");
            if jobs.contains_key(&job.id) {
                return Err(AgentError::JobDuplicate(job.id));
            }
            jobs.insert(job.id, job.clone());
        }
        self.notify(JobEvent::Added, &job);
        Ok(())
    }

    pub fn remove(&self, id: i64) -> Option<Job> {
        let removed = self.inner.jobs.write().expect("job registry map poisoned").remove(&id);
        if let Some(ref job) = removed {
            self.notify(JobEvent::Removed, job);
        }
        removed
    }

    /// Returns an owned copy of the job with dead pids elided. If the
    /// resulting pid list is empty the job is scheduled for removal via a
    /// deferred call issued after this function's read lock has already
    /// been dropped — never while holding it, and never as a dangling
    /// reference into the map.
    pub fn find(&self, id: i64) -> Option<Job> {
        let snapshot = {
            let jobs = self.inner.jobs.read().expect("job registry map poisoned");
            jobs.get(&id).cloned()
        };

        let mut job = snapshot?;
        job.pids.retain(|&pid| is_process_running(pid));

        if job.pids.is_empty() {
            self.remove(id);
            return None;
        }

        // Persist the liveness filtering so `snapshot()` and subsequent
        // `find()` calls observe the shrunk pid list too.
        if let Some(stored) = self.inner.jobs.write().expect("job registry map poisoned").get_mut(&id) {
            stored.pids = job.pids.clone();
        }

        Some(job)
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.inner.jobs.read().expect("job registry map poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.read().expect("job registry map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: i64, pids: Vec<i32>) -> Job {
        Job::new(id, pids, vec!["proc".to_string()])
    }

    #[test]
    fn add_and_find_roundtrip() {
        let reg = JobRegistry::new();
        reg.add(job(1, vec![std::process::id() as i32])).unwrap();
        let found = reg.find(1).expect("job should be present");
        assert_eq!(found.id, 1);
    }

    #[test]
    fn duplicate_add_rejected() {
        let reg = JobRegistry::new();
        reg.add(job(1, vec![std::process::id() as i32])).unwrap();
        let err = reg.add(job(1, vec![std::process::id() as i32])).unwrap_err();
        assert!(matches!(err, AgentError::JobDuplicate(1)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn empty_pids_rejected() {
        let reg = JobRegistry::new();
        let err = reg.add(job(2, vec![])).unwrap_err();
        assert!(matches!(err, AgentError::JobEmptyPids(2)));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn dead_pid_is_dropped_and_job_removed() {
        let reg = JobRegistry::new();
        reg.add(job(3, vec![999_999])).unwrap();
        assert!(reg.find(3).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn lifecycle_callbacks_fire_in_order() {
        let reg = JobRegistry::new();
        let events: Arc<std::sync::Mutex<Vec<JobEvent>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_cb = Arc::clone(&events);
        reg.subscribe(move |event, _job| {
            events_cb.lock().expect("events mutex poisoned").push(event);
        });
        reg.add(job(4, vec![std::process::id() as i32])).unwrap();
        reg.remove(4);
        let recorded = events.lock().expect("events mutex poisoned").clone();
        assert_eq!(recorded, vec![JobEvent::Added, JobEvent::Removed]);
    }
}
