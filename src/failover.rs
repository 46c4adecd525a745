// jobsentry: file-lease hot-standby failover

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use crate::error::AgentError;
use crate::model::Lease;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LEASE_MS: u64 = 1_000;
const PRE_PROMOTE_RATIO: f64 = 0.30;
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);
const SLAVE_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Implemented by the owning application so the failover node can push a
/// pre-promotion snapshot into a follower and pull one out of a master
/// nearing the end of its lease.
pub trait StateProvider: Send + Sync {
    fn on_promote(&self);
    fn on_demote(&self);
    fn snapshot(&self) -> serde_json::Value;
    fn load_snapshot(&self, snapshot: &serde_json::Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Follower,
}

struct LeaseFile {
    path: PathBuf,
}

impl LeaseFile {
    fn open_rw(&self) -> std::io::Result<File> {
        OpenOptions::new().read(true).write(true).create(true).open(&self.path)
    }

    fn read(&self) -> Lease {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Lease::default(),
        };
        let mut content = String::new();
        if file.read_to_string(&mut content).is_err() || content.trim().is_empty() {
            return Lease::default();
        }
        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "lease file corrupt, treating as absent");
            Lease::default()
        })
    }

    fn write(&self, file: &mut File, lease: &Lease) -> std::io::Result<()> {
        let body = serde_json::to_vec(lease).unwrap_or_default();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    /// Attempts to take over the lease: holds the advisory write lock for
    /// the duration of the check-and-increment so no other cooperating
    /// process can race it, and leaves the lock held on success (the
    /// caller is now master and keeps holding it for the node's lifetime).
    fn try_acquire(&self, snapshot: serde_json::Value) -> Result<(File, Lease), AgentError> {
        let mut file = self.open_rw().map_err(|e| AgentError::LeaseBusy.context(e))?;
        file.try_lock_exclusive().map_err(|_| AgentError::LeaseBusy)?;

        let current = self.read();
        let now = now_ms();
        if current.epoch != 0 && now < current.expire_at_ms {
            let _ = file.unlock();
            return Err(AgentError::LeaseBusy);
        }

        let next = Lease {
            epoch: current.epoch + 1,
            updated_at_ms: now,
            expire_at_ms: now + LEASE_MS,
            snapshot,
        };
        self.write(&mut file, &next).map_err(|e| AgentError::LeaseBusy.context(e))?;
        Ok((file, next))
    }
}

// `AgentError::LeaseBusy` has no payload to attach an io error to; keep the
// detail in logs instead of widening the error type for a rare path.
trait WithIoContext {
    fn context(self, err: std::io::Error) -> AgentError;
}
impl WithIoContext for AgentError {
    fn context(self, err: std::io::Error) -> AgentError {
        tracing::debug!(error = %err, "lease io error");
        self
    }
}

/// Scans `pid_dir` for live peers (a dead entry's null-signal fails) and
/// sends each one SIGUSR2 so they refresh their own peer tables. Free
/// function rather than a method so it can run from either `run_as_master`
/// or a follower thread that has just promoted itself, without needing a
/// `&FailoverNode` on hand in the latter case.
fn notify_peers(pid_dir: &Path) {
    let entries = match fs::read_dir(pid_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let my_pid = std::process::id() as i32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(pid_str) = name.strip_prefix("node_") {
            if let Ok(pid) = pid_str.parse::<i32>() {
                if pid == my_pid {
                    continue;
                }
                if crate::job_registry::is_process_running(pid) {
                    unsafe {
                        libc::kill(pid, libc::SIGUSR2);
                    }
                } else {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

/// The ongoing master role: refreshes the lease every `HEARTBEAT_INTERVAL`,
/// taking a fresh snapshot once the lease has burned through
/// `PRE_PROMOTE_RATIO` of its time-to-live so a follower picking it up mid
/// read gets state no staler than that window. `file` is the advisory-locked
/// handle from the promotion that led here; it is held for as long as this
/// loop runs, releasing only when the thread exits (shutdown or the lock is
/// dropped along with the thread).
fn master_heartbeat_loop(
    lease_file: LeaseFile,
    state: Arc<dyn StateProvider>,
    stop: Arc<AtomicBool>,
    mut file: File,
) {
    let mut last_epoch = 0u64;
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(HEARTBEAT_INTERVAL);
        let now = now_ms();
        let current = lease_file.read();
        last_epoch = current.epoch.max(last_epoch);
        let elapsed_fraction = if current.expire_at_ms > current.updated_at_ms {
            (now.saturating_sub(current.updated_at_ms)) as f64
                / (current.expire_at_ms - current.updated_at_ms) as f64
        } else {
            1.0
        };
        let snapshot = if elapsed_fraction >= PRE_PROMOTE_RATIO {
            state.snapshot()
        } else {
            current.snapshot.clone()
        };
        let next = Lease {
            epoch: last_epoch,
            updated_at_ms: now,
            expire_at_ms: now + LEASE_MS,
            snapshot,
        };
        if let Err(e) = lease_file.write(&mut file, &next) {
            tracing::warn!(error = %e, "failed to refresh lease");
        }
    }
}

pub struct FailoverNode {
    lease_file: LeaseFile,
    pid_dir: PathBuf,
    state: Arc<dyn StateProvider>,
    stop: Arc<AtomicBool>,
    role: Arc<Mutex<Role>>,
    thread: Option<JoinHandle<()>>,
    // SIGUSR1 (old master exit) wakes a waiting follower early instead of
    // it sleeping out the rest of its SLAVE_CHECK interval.
    promote_signal: Arc<(Mutex<bool>, Condvar)>,
}

impl FailoverNode {
    pub fn new(lock_path: &str, pid_dir: &str, state: Arc<dyn StateProvider>) -> std::io::Result<Self> {
        fs::create_dir_all(pid_dir)?;
        let pid_file = Path::new(pid_dir).join(format!("node_{}", std::process::id()));
        fs::write(pid_file, std::process::id().to_string())?;
        Ok(Self {
            lease_file: LeaseFile { path: PathBuf::from(lock_path) },
            pid_dir: PathBuf::from(pid_dir),
            state,
            stop: Arc::new(AtomicBool::new(false)),
            role: Arc::new(Mutex::new(Role::Follower)),
            thread: None,
            promote_signal: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    pub fn role(&self) -> Role {
        *self.role.lock().expect("failover role mutex poisoned")
    }

    /// SIGUSR1 handler hook: wakes a waiting follower so it retries lease
    /// acquisition immediately instead of waiting out its current
    /// SLAVE_CHECK interval. A no-op on a node that is already master.
    pub fn request_promotion(&self) {
        let (lock, cv) = &*self.promote_signal;
        *lock.lock().expect("promote signal mutex poisoned") = true;
        cv.notify_all();
    }

    /// SIGUSR2 handler hook: rescans `pid_dir`, pruning entries for peers
    /// that are no longer alive. Does not itself send any signal — that is
    /// `notify_peers`'s job on promotion — so a SIGUSR2 broadcast never
    /// cascades into a further round of signals.
    pub fn refresh_peer_table(&self) {
        let entries = match fs::read_dir(&self.pid_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(pid_str) = name.strip_prefix("node_") {
                if let Ok(pid) = pid_str.parse::<i32>() {
                    if !crate::job_registry::is_process_running(pid) {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
    }

    pub fn start(&mut self) {
        match self.lease_file.try_acquire(self.state.snapshot()) {
            Ok((file, _lease)) => self.run_as_master(file),
            Err(_) => self.run_as_follower(),
        }
    }

    fn run_as_master(&mut self, file: File) {
        *self.role.lock().expect("failover role mutex poisoned") = Role::Master;
        self.state.on_promote();
        notify_peers(&self.pid_dir);

        let lease_file = LeaseFile { path: self.lease_file.path.clone() };
        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop);
        self.thread = Some(std::thread::spawn(move || {
            master_heartbeat_loop(lease_file, state, stop, file);
        }));
    }

    /// A follower's thread body: polls the lease and, on expiry, attempts
    /// promotion. On success it does not return — it falls straight into
    /// `master_heartbeat_loop` in the same thread, so the advisory lock
    /// acquired by `try_acquire` is held continuously from the moment of
    /// promotion rather than being dropped and leaving the lease
    /// unrefreshed and un-held.
    fn run_as_follower(&mut self) {
        *self.role.lock().expect("failover role mutex poisoned") = Role::Follower;

        let lease_file = LeaseFile { path: self.lease_file.path.clone() };
        let pid_dir = self.pid_dir.clone();
        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop);
        let role = Arc::clone(&self.role);
        let promote_signal = Arc::clone(&self.promote_signal);
        self.thread = Some(std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let (lock, cv) = &*promote_signal;
                let mut requested = lock.lock().expect("promote signal mutex poisoned");
                if !*requested {
                    let (guard, _) = cv
                        .wait_timeout(requested, SLAVE_CHECK_INTERVAL)
                        .expect("promote signal condvar poisoned");
                    requested = guard;
                }
                *requested = false;
                drop(requested);

                let lease = lease_file.read();
                let now = now_ms();
                if now < lease.expire_at_ms {
                    state.load_snapshot(&lease.snapshot);
                    continue;
                }
                match lease_file.try_acquire(state.snapshot()) {
                    Ok((file, _lease)) => {
                        *role.lock().expect("failover role mutex poisoned") = Role::Master;
                        state.on_promote();
                        notify_peers(&pid_dir);
                        master_heartbeat_loop(lease_file, state, stop, file);
                        return;
                    }
                    Err(_) => {
                        std::thread::sleep(RETRY_BACKOFF);
                    }
                }
            }
        }));
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.state.on_demote();
        let pid_file = self.pid_dir.join(format!("node_{}", std::process::id()));
        let _ = fs::remove_file(pid_file);
    }
}

impl Drop for FailoverNode {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingState {
        value: StdMutex<i64>,
        promoted: AtomicBool,
    }
    impl StateProvider for RecordingState {
        fn on_promote(&self) {
            self.promoted.store(true, Ordering::SeqCst);
        }
        fn on_demote(&self) {}
        fn snapshot(&self) -> serde_json::Value {
            serde_json::json!({ "value": *self.value.lock().expect("value mutex poisoned") })
        }
        fn load_snapshot(&self, snapshot: &serde_json::Value) {
            if let Some(v) = snapshot.get("value").and_then(|v| v.as_i64()) {
                *self.value.lock().expect("value mutex poisoned") = v;
            }
        }
    }

    #[test]
    fn first_acquirer_becomes_master_with_epoch_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("lease.json");
        let pid_dir = dir.path().join("pids");

        let state = Arc::new(RecordingState {
            value: StdMutex::new(42),
            promoted: AtomicBool::new(false),
        });
        let mut node = FailoverNode::new(
            lock_path.to_str().expect("utf8 path"),
            pid_dir.to_str().expect("utf8 path"),
            state.clone(),
        )
        .expect("construct node");
        node.start();
        assert_eq!(node.role(), Role::Master);
        assert!(state.promoted.load(Ordering::SeqCst));
        node.shutdown();

        let lease = LeaseFile { path: lock_path }.read();
        assert_eq!(lease.epoch, 1);
    }

    #[test]
    fn second_acquirer_sees_lease_busy_while_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("lease.json");

        let lease_a = LeaseFile { path: lock_path.clone() };
        let (file, _lease) = lease_a.try_acquire(serde_json::Value::Null).expect("first acquire succeeds");

        let lease_b = LeaseFile { path: lock_path };
        let result = lease_b.try_acquire(serde_json::Value::Null);
        assert!(result.is_err());
        drop(file);
    }
}
