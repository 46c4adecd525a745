// jobsentry main entry point

use clap::Parser;
use jobsentry::cli::{Cli, Mode};
use jobsentry::collector::CollectorRegistry;
use jobsentry::config::Config;
use jobsentry::failover::{FailoverNode, Role};
use jobsentry::job_commands::apply_frames;
use jobsentry::job_registry::JobRegistry;
use jobsentry::job_starter::{JobStarter, LaunchOptions};
use jobsentry::stream_watcher::{StreamWatcher, WatcherKind};
use jobsentry::model::Job;
use jobsentry::orchestrator::{load_descriptors, SamplingOrchestrator};
use jobsentry::sink::file::FileSink;
use jobsentry::sink::http::{HttpSink, HttpSinkOptions, IndexMapping};
use jobsentry::sink::WriterPipeline;
use jobsentry::timer::TimerWheel;
use jobsentry::{register_builtin_collectors, RegistrySnapshotState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

const LOGO: &str = r#"
       _       _                    _
      (_) ___ | |__  ___  ___ _ __ | |_ _ __ _   _
      | |/ _ \| '_ \/ __|/ _ \ '_ \| __| '__| | | |
      | | (_) | |_) \__ \  __/ | | | |_| |  | |_| |
     _/ |\___/|_.__/|___/\___|_| |_|\__|_|   \__, |
    |__/                                     |___/
"#;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static PROMOTE_REQUESTED: AtomicBool = AtomicBool::new(false);
static REFRESH_PEERS_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigterm(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigusr1(_sig: libc::c_int) {
    PROMOTE_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigusr2(_sig: libc::c_int) {
    REFRESH_PEERS_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_sigterm as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_sigterm as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, handle_sigusr1 as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handle_sigusr2 as libc::sighandler_t);
    }
}

/// Reads a scalar field out of a writer element's own `config` sub-blob,
/// the same shape `load_descriptors`/`orchestrator.rs` reads `freq` from a
/// collector's `config` blob — per-writer keys (`batch_size`, `path`,
/// `host`, ...) live under the element's `config` map, not in a top-level
/// section named after the writer.
fn cfg_str(cfg: &serde_yaml::Value, key: &str) -> Option<String> {
    cfg.get(key)?.as_str().map(str::to_string)
}

fn cfg_int(cfg: &serde_yaml::Value, key: &str) -> Option<i64> {
    cfg.get(key)?.as_i64()
}

fn build_sinks(config: &Config) -> Vec<Arc<Mutex<WriterPipeline>>> {
    let writer_entries = config
        .get_array_with("writers_config", "writers", |v| {
            let name = v.get("name")?.as_str()?.to_string();
            let kind = v.get("type")?.as_str()?.to_string();
            let cfg = v.get("config").cloned().unwrap_or(serde_yaml::Value::Null);
            Some((name, kind, cfg))
        })
        .unwrap_or_default();

    let mut pipelines = Vec::new();
    for (name, kind, cfg) in writer_entries {
        let batch_size = cfg_int(&cfg, "batch_size").unwrap_or(100) as usize;
        match kind.as_str() {
            "FileWriter" => match cfg_str(&cfg, "path") {
                Some(path) => match FileSink::open(&path) {
                    Ok(backend) => pipelines.push(Arc::new(Mutex::new(WriterPipeline::new(backend, batch_size)))),
                    Err(e) => error!(writer = %name, error = %e, "failed to open file sink"),
                },
                None => error!(writer = %name, "file writer missing path"),
            },
            "ESWriter" | "HttpWriter" => {
                let host = cfg_str(&cfg, "host").unwrap_or_else(|| "127.0.0.1".to_string());
                let port = cfg_int(&cfg, "port").unwrap_or(9200) as u16;
                let index_prefix = cfg_str(&cfg, "index_prefix").unwrap_or_else(|| "jobsentry".to_string());
                let write_timeout_ms = cfg_int(&cfg, "write_timeout").unwrap_or(5000) as u64;
                let indexs = cfg
                    .get("indexs")
                    .and_then(|v| v.as_sequence())
                    .map(|seq| {
                        seq.iter()
                            .filter_map(|v| {
                                let collector_name = v.get("collector_name")?.as_str()?.to_string();
                                let index_name = v.get("index_name")?.as_str()?.to_string();
                                Some(IndexMapping { collector_name, index_name })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let options = HttpSinkOptions {
                    host,
                    port,
                    index_prefix,
                    batch_size,
                    write_timeout: Duration::from_millis(write_timeout_ms),
                    indexs,
                };
                match HttpSink::new(options) {
                    Ok(backend) => pipelines.push(Arc::new(Mutex::new(WriterPipeline::new(backend, batch_size)))),
                    Err(e) => error!(writer = %name, error = %e, "bulk http sink readiness check failed"),
                }
            }
            other => warn!(writer = %name, kind = other, "unknown writer type, skipping"),
        }
    }
    pipelines
}

fn main() {
    println!("{LOGO}");
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Composition root: configuration first, sinks next, orchestrator
    // last, failover node outermost.
    let config = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let pid_dir = config.get_string_opt("lens_config", "pid_dir").unwrap_or_else(|| "/tmp/jobsentry".to_string());
    let lock_path = config.get_string_opt("lens_config", "lock_path").unwrap_or_else(|| "/tmp/jobsentry/lease.json".to_string());

    let sinks = build_sinks(&config);

    let collectors = CollectorRegistry::new();
    register_builtin_collectors(&collectors);
    let descriptors = load_descriptors(&config).unwrap_or_default();
    let descriptor_names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();

    let registry = JobRegistry::new();
    let timers = Arc::new(Mutex::new(TimerWheel::new(2)));
    let orchestrator = SamplingOrchestrator::new(registry.clone(), collectors, descriptors, Arc::clone(&timers));
    for sink in &sinks {
        let sink = Arc::clone(sink);
        orchestrator.add_finish_callback(move |record| {
            sink.lock().expect("sink pipeline mutex poisoned").on_finish(record);
        });
    }

    let state = Arc::new(RegistrySnapshotState::new(registry.clone()));
    let mut node = match FailoverNode::new(&lock_path, &pid_dir, Arc::clone(&state) as _) {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "failed to initialize failover node");
            std::process::exit(1);
        }
    };
    node.start();

    install_signal_handlers();

    let job_adder_fifo = config.get_string_opt("collectors_config", "job_adder_fifo");
    let mut job_adder_watcher = job_adder_fifo.as_ref().and_then(|path| {
        let registry_for_frames = registry.clone();
        match StreamWatcher::start(
            WatcherKind::Fifo { path: path.into() },
            Box::new(move |buf| apply_frames(&registry_for_frames, buf)),
        ) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(path, error = %e, "failed to start job adder fifo watcher");
                None
            }
        }
    });

    let job_starter = Arc::new(JobStarter::new());
    if matches!(cli.mode, Mode::Starter) {
        if let Some(exe) = cli.exec.clone() {
            job_starter.set_callback(move |_pid, exit_code| {
                // Runs on the starter's own wait-thread: exit directly
                // rather than calling `shutdown`, which would try to join
                // this very thread and deadlock.
                info!(exit_code, "launched child exited, terminating");
                std::process::exit(exit_code);
            });

            match job_starter.launch(LaunchOptions {
                exe,
                args: cli.args.clone(),
                // The monitored child runs for the agent's whole lifetime;
                // no wait timeout, matching the original starter's
                // permanent-wait default for an untimed launch.
                timeout: None,
            }) {
                Ok(pid) => {
                    if node.role() == Role::Master {
                        let job = Job::new(1, vec![pid], descriptor_names.clone());
                        if let Err(e) = registry.add(job) {
                            warn!(error = %e, "failed to register launched child as job 1");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to launch child process");
                    std::process::exit(1);
                }
            }
        } else {
            warn!("--mode starter requires --exec, running without a launched child");
        }
    }

    while !TERMINATE.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if PROMOTE_REQUESTED.swap(false, Ordering::SeqCst) {
            info!("SIGUSR1 received, requesting promotion attempt");
            node.request_promotion();
        }
        if REFRESH_PEERS_REQUESTED.swap(false, Ordering::SeqCst) {
            info!("SIGUSR2 received, refreshing peer pid table");
            node.refresh_peer_table();
        }
    }

    info!("shutting down");
    if let Some(watcher) = job_adder_watcher.as_mut() {
        watcher.stop();
    }
    job_starter.shutdown();
    node.shutdown();
    timers.lock().expect("timer wheel mutex poisoned").shutdown();
    for sink in sinks {
        sink.lock().expect("sink pipeline mutex poisoned").shutdown();
    }
}
