// jobsentry: sampling orchestrator — binds jobs to collectors and drives
// periodic sampling

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use crate::collector::{Collector, CollectorRegistry};
use crate::config::Config;
use crate::error::AgentError;
use crate::job_registry::JobRegistry;
use crate::model::{CollectorDescriptor, JobEvent, SamplingRecord};
use crate::timer::TimerWheel;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type FinishCallback = Box<dyn Fn(&SamplingRecord) + Send + Sync>;

struct CollectorState {
    instance: Box<dyn Collector>,
    job_ids: Vec<i64>,
    timer_id: Option<crate::timer::TimerId>,
}

struct Shared {
    registry: JobRegistry,
    collectors: CollectorRegistry,
    descriptors: HashMap<String, CollectorDescriptor>,
    // One fine-grained lock per collector name: the outer map lock only
    // ever guards lookup/insert/remove of an entry, never the blocking
    // `/proc` I/O inside `collect`, so a slow collector's tick never stalls
    // another collector's tick or an unrelated job's attach/detach.
    states: Mutex<HashMap<String, Arc<Mutex<CollectorState>>>>,
    callbacks: Mutex<Vec<FinishCallback>>,
}

/// One repeating timer per collector (not per job): each tick resolves the
/// collector's attached jobs, invokes `collect`, and fans the resulting
/// record out to every registered sink callback.
pub struct SamplingOrchestrator {
    shared: Arc<Shared>,
    timers: Arc<Mutex<TimerWheel>>,
}

impl SamplingOrchestrator {
    pub fn new(
        registry: JobRegistry,
        collectors: CollectorRegistry,
        descriptors: Vec<CollectorDescriptor>,
        timers: Arc<Mutex<TimerWheel>>,
    ) -> Arc<Self> {
        let descriptors = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        let shared = Arc::new(Shared {
            registry: registry.clone(),
            collectors,
            descriptors,
            states: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        });
        let orchestrator = Arc::new(Self { shared, timers });

        let orchestrator_for_cb = Arc::clone(&orchestrator);
        registry.subscribe(move |event, job| {
            orchestrator_for_cb.on_lifecycle_event(event, job);
        });

        orchestrator
    }

    pub fn add_finish_callback<F>(&self, callback: F)
    where
        F: Fn(&SamplingRecord) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .lock()
            .expect("orchestrator callback list poisoned")
            .push(Box::new(callback));
    }

    fn on_lifecycle_event(self: &Arc<Self>, event: JobEvent, job: &crate::model::Job) {
        match event {
            JobEvent::Added => {
                for name in &job.collectors {
                    self.attach(name, job.id);
                }
            }
            JobEvent::Removed => {
                for name in &job.collectors {
                    self.detach(name, job.id);
                }
            }
        }
    }

    fn attach(self: &Arc<Self>, name: &str, job_id: i64) {
        let existing = self.shared.states.lock().expect("collector state map poisoned").get(name).cloned();
        match existing {
            Some(state) => {
                let mut state = state.lock().expect("collector state poisoned");
                if !state.job_ids.contains(&job_id) {
                    state.job_ids.push(job_id);
                }
            }
            None => {
                self.start_collector(name);
                if let Some(state) = self.shared.states.lock().expect("collector state map poisoned").get(name).cloned() {
                    let mut state = state.lock().expect("collector state poisoned");
                    if !state.job_ids.contains(&job_id) {
                        state.job_ids.push(job_id);
                    }
                }
            }
        }
    }

    fn detach(&self, name: &str, job_id: i64) {
        let state = self.shared.states.lock().expect("collector state map poisoned").get(name).cloned();
        if let Some(state) = state {
            state.lock().expect("collector state poisoned").job_ids.retain(|&id| id != job_id);
        }
    }

    fn start_collector(self: &Arc<Self>, name: &str) {
        let descriptor = match self.shared.descriptors.get(name) {
            Some(d) => d.clone(),
            None => {
                tracing::warn!(collector = name, "no descriptor for collector, skipping start");
                return;
            }
        };
        let instance = match self.shared.collectors.create(&descriptor.kind, &descriptor.config) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!(collector = name, error = %e, "collector failed to initialize");
                return;
            }
        };

        let freq_hz: f64 = match &descriptor.config.get("freq") {
            Some(v) => v.as_f64().unwrap_or(1.0),
            None => 1.0,
        };
        let period = std::time::Duration::from_millis((1000.0 / freq_hz.max(0.001)) as u64);

        let orchestrator = Arc::clone(self);
        let name_owned = name.to_string();
        let timer_id = self
            .timers
            .lock()
            .expect("timer wheel poisoned")
            .schedule_repeating(period, move || orchestrator.tick(&name_owned));

        self.shared.states.lock().expect("collector state map poisoned").insert(
            name.to_string(),
            Arc::new(Mutex::new(CollectorState {
                instance,
                job_ids: Vec::new(),
                timer_id: Some(timer_id),
            })),
        );
    }

    fn stop_collector(&self, name: &str) {
        let state = self.shared.states.lock().expect("collector state map poisoned").remove(name);
        if let Some(state) = state {
            let mut state = state.lock().expect("collector state poisoned");
            if let Some(timer_id) = state.timer_id {
                self.timers.lock().expect("timer wheel poisoned").cancel(timer_id);
            }
            state.instance.deinit();
        }
    }

    fn tick(&self, name: &str) {
        let state = self.shared.states.lock().expect("collector state map poisoned").get(name).cloned();
        let Some(state) = state else { return };

        let job_ids = {
            let guard = state.lock().expect("collector state poisoned");
            if guard.job_ids.is_empty() {
                drop(guard);
                self.stop_collector(name);
                return;
            }
            guard.job_ids.clone()
        };

        for job_id in job_ids {
            let job = match self.shared.registry.find(job_id) {
                Some(job) => job,
                None => continue,
            };
            let payload = {
                let mut guard = state.lock().expect("collector state poisoned");
                match guard.instance.collect(&job) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::debug!(collector = name, job = job_id, error = %e, "collect failed, skipping tick");
                        continue;
                    }
                }
            };
            let record = SamplingRecord {
                collector_name: name.to_string(),
                job,
                payload,
                timestamp: Utc::now(),
            };
            let callbacks = self.shared.callbacks.lock().expect("orchestrator callback list poisoned");
            for cb in callbacks.iter() {
                cb(&record);
            }
        }
    }
}

/// Reads `collectors_config.collectors` from configuration into descriptors.
pub fn load_descriptors(config: &Config) -> Result<Vec<CollectorDescriptor>, AgentError> {
    config.get_array_with("collectors_config", "collectors", |v| {
        let name = v.get("name")?.as_str()?.to_string();
        let kind = v.get("type")?.as_str()?.to_string();
        let cfg = v.get("config").cloned().unwrap_or(serde_yaml::Value::Null);
        Some(CollectorDescriptor { name, kind, config: cfg })
    })
}
