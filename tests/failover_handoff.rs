// Two-node failover handoff: a master dies, the cooperating follower should
// pick up the lease once it actually expires, with its epoch incremented
// from the prior holder and the prior holder's last snapshot carried over.

use jobsentry::failover::{FailoverNode, Role, StateProvider};
use jobsentry::model::Lease;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingState {
    value: AtomicI64,
    promoted: AtomicBool,
}

impl StateProvider for CountingState {
    fn on_promote(&self) {
        self.promoted.store(true, Ordering::SeqCst);
    }
    fn on_demote(&self) {
        self.promoted.store(false, Ordering::SeqCst);
    }
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "value": self.value.load(Ordering::SeqCst) })
    }
    fn load_snapshot(&self, snapshot: &serde_json::Value) {
        if let Some(v) = snapshot.get("value").and_then(|v| v.as_i64()) {
            self.value.store(v, Ordering::SeqCst);
        }
    }
}

#[test]
fn master_handoff_carries_epoch_and_snapshot_to_follower() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("lease.json");
    let pid_dir = dir.path().join("pids");

    let state_a = Arc::new(CountingState {
        value: AtomicI64::new(7),
        promoted: AtomicBool::new(false),
    });
    let mut node_a = FailoverNode::new(
        lock_path.to_str().expect("utf8 path"),
        pid_dir.to_str().expect("utf8 path"),
        state_a.clone() as Arc<dyn StateProvider>,
    )
    .expect("construct node a");
    node_a.start();
    assert_eq!(node_a.role(), Role::Master);

    let state_b = Arc::new(CountingState {
        value: AtomicI64::new(0),
        promoted: AtomicBool::new(false),
    });
    let mut node_b = FailoverNode::new(
        lock_path.to_str().expect("utf8 path"),
        pid_dir.to_str().expect("utf8 path"),
        state_b.clone() as Arc<dyn StateProvider>,
    )
    .expect("construct node b");
    node_b.start();
    assert_eq!(node_b.role(), Role::Follower);

    // B's poll cadence is well under a second; give it time to have read
    // A's lease (and thus A's snapshot) at least once before A goes away.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(
        state_b.value.load(Ordering::SeqCst),
        7,
        "follower should have loaded the master's snapshot before handoff"
    );

    node_a.shutdown();

    // The lease only becomes takeable once it actually expires, which can be
    // up to ~1s (its time-to-live) past A's last heartbeat write, not merely
    // whenever A's process/lock goes away.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while node_b.role() != Role::Master && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(node_b.role(), Role::Master, "follower did not promote after master shutdown");
    assert!(state_b.promoted.load(Ordering::SeqCst));
    assert_eq!(state_b.value.load(Ordering::SeqCst), 7, "promoted follower should keep the carried-over value");

    node_b.shutdown();

    let content = std::fs::read_to_string(&lock_path).expect("lease file readable");
    let lease: Lease = serde_json::from_str(&content).expect("lease file valid json");
    assert_eq!(lease.epoch, 2, "epoch should increment by one across the handoff");
}
