// jobsentry: writer pipeline — double-buffered async batch sink

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

pub mod file;
pub mod http;

use crate::model::SamplingRecord;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Implemented by a concrete sink backend (HTTP, file, …). `flush` is
/// invoked on the drainer thread with no producer lock held.
pub trait SinkBackend: Send {
    fn flush(&mut self, batch: &[SamplingRecord]);
}

struct Buffers {
    front: Vec<SamplingRecord>,
    capacity: usize,
    need_flush: bool,
    stop: bool,
}

struct Shared {
    buffers: Mutex<Buffers>,
    cv: Condvar,
}

/// Double-buffered asynchronous sink: producers append to `front` under a
/// short-held lock; a single drainer thread swaps `front` for an empty
/// `back`, releases the lock, then flushes `back` through the backend.
pub struct WriterPipeline {
    shared: Arc<Shared>,
    drainer: Option<JoinHandle<()>>,
}

impl WriterPipeline {
    pub fn new<B: SinkBackend + 'static>(mut backend: B, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            buffers: Mutex::new(Buffers {
                front: Vec::with_capacity(capacity),
                capacity,
                need_flush: false,
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let drainer_shared = Arc::clone(&shared);
        let drainer = std::thread::spawn(move || loop {
            let mut back;
            {
                let mut guard = drainer_shared.buffers.lock().expect("sink buffer poisoned");
                loop {
                    if guard.stop {
                        back = std::mem::take(&mut guard.front);
                        drop(guard);
                        if !back.is_empty() {
                            backend.flush(&back);
                        }
                        return;
                    }
                    if guard.need_flush || !guard.front.is_empty() {
                        break;
                    }
                    guard = drainer_shared.cv.wait(guard).expect("sink condvar poisoned");
                }
                back = std::mem::take(&mut guard.front);
                guard.need_flush = false;
            }
            if !back.is_empty() {
                backend.flush(&back);
            }
        });

        Self {
            shared,
            drainer: Some(drainer),
        }
    }

    /// Registered with the sampling orchestrator as a sink's finish
    /// callback: appends the record and wakes the drainer once the front
    /// buffer reaches capacity.
    pub fn on_finish(&self, record: &SamplingRecord) {
        let mut guard = self.shared.buffers.lock().expect("sink buffer poisoned");
        guard.front.push(record.clone());
        if guard.front.len() >= guard.capacity {
            guard.need_flush = true;
            self.shared.cv.notify_all();
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut guard = self.shared.buffers.lock().expect("sink buffer poisoned");
            guard.stop = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.drainer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriterPipeline {
    fn drop(&mut self) {
        if self.drainer.is_some() {
            self.shutdown();
        }
    }
}
