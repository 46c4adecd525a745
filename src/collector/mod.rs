// jobsentry: pluggable sampling strategies
// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

pub mod proc;

use crate::error::AgentError;
use crate::model::{CollectorPayload, Job};
use std::collections::HashMap;
use std::sync::Mutex;

/// Contract every collector instance implements. `init` runs at most once
/// before the first `collect`; `deinit` is infallible and runs at most once
/// after the last `collect`.
pub trait Collector: Send {
    fn init(&mut self, config: &serde_yaml::Value) -> Result<(), AgentError>;
    fn collect(&mut self, job: &Job) -> Result<CollectorPayload, AgentError>;
    fn deinit(&mut self);
}

type Factory = Box<dyn Fn() -> Box<dyn Collector> + Send + Sync>;

/// Name-to-factory mapping. Factories are installed explicitly by the
/// composition root at startup (`register`), not via static-initialization
/// side effects.
pub struct CollectorRegistry {
    factories: Mutex<HashMap<String, Factory>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Collector> + Send + Sync + 'static,
    {
        self.factories
            .lock()
            .expect("collector registry poisoned")
            .insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, config: &serde_yaml::Value) -> Result<Box<dyn Collector>, AgentError> {
        let factories = self.factories.lock().expect("collector registry poisoned");
        let factory = factories
            .get(name)
            .ok_or_else(|| AgentError::CollectorUnknown(name.to_string()))?;
        let mut instance = factory();
        drop(factories);
        instance
            .init(config)
            .map_err(|e| AgentError::CollectorInitFailed(name.to_string(), e.to_string()))?;
        Ok(instance)
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.lock().expect("collector registry poisoned").keys().cloned().collect()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
