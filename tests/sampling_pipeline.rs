// End-to-end: admit a job sampling the current process, run for a couple of
// ticks at a high frequency, and confirm the file sink receives records
// carrying this process's own pid.

use jobsentry::collector::CollectorRegistry;
use jobsentry::job_registry::JobRegistry;
use jobsentry::model::{CollectorDescriptor, Job};
use jobsentry::orchestrator::SamplingOrchestrator;
use jobsentry::register_builtin_collectors;
use jobsentry::sink::file::FileSink;
use jobsentry::sink::WriterPipeline;
use jobsentry::timer::TimerWheel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn proc_collector_samples_self_into_file_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out_path = dir.path().join("records.ndjson");

    let collectors = CollectorRegistry::new();
    register_builtin_collectors(&collectors);

    let descriptor = CollectorDescriptor {
        name: "proc".to_string(),
        kind: "proc".to_string(),
        config: serde_yaml::from_str("freq: 20").expect("valid yaml"),
    };

    let registry = JobRegistry::new();
    let timers = Arc::new(Mutex::new(TimerWheel::new(2)));
    let orchestrator = SamplingOrchestrator::new(registry.clone(), collectors, vec![descriptor], Arc::clone(&timers));

    let backend = FileSink::open(out_path.to_str().expect("utf8 path")).expect("open file sink");
    let pipeline = Arc::new(Mutex::new(WriterPipeline::new(backend, 1)));
    let pipeline_for_cb = Arc::clone(&pipeline);
    orchestrator.add_finish_callback(move |record| {
        pipeline_for_cb.lock().expect("pipeline mutex poisoned").on_finish(record);
    });

    registry
        .add(Job::new(1, vec![std::process::id() as i32], vec!["proc".to_string()]))
        .expect("job admitted");

    std::thread::sleep(Duration::from_millis(400));

    pipeline.lock().expect("pipeline mutex poisoned").shutdown();
    timers.lock().expect("timer wheel mutex poisoned").shutdown();

    let content = std::fs::read_to_string(&out_path).expect("read sink output");
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.len() >= 4, "expected several samples, got {}", lines.len());

    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json line");
    assert_eq!(first["collector_name"], "proc");
    let pid = first["data"][0]["pid"].as_i64().expect("pid field present");
    assert_eq!(pid, std::process::id() as i64);
}

#[test]
fn duplicate_job_id_is_rejected_and_emits_no_extra_event() {
    let registry = JobRegistry::new();
    let added = Arc::new(Mutex::new(0usize));
    let added_cb = Arc::clone(&added);
    registry.subscribe(move |event, _job| {
        if matches!(event, jobsentry::JobEvent::Added) {
            *added_cb.lock().expect("counter mutex poisoned") += 1;
        }
    });

    registry
        .add(Job::new(1, vec![std::process::id() as i32], vec!["proc".to_string()]))
        .expect("first add succeeds");
    let err = registry
        .add(Job::new(1, vec![std::process::id() as i32], vec!["proc".to_string()]))
        .expect_err("duplicate add must fail");

    assert!(matches!(err, jobsentry::AgentError::JobDuplicate(1)));
    assert_eq!(registry.len(), 1);
    assert_eq!(*added.lock().expect("counter mutex poisoned"), 1);
}
