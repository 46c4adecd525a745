// jobsentry: core data model shared across the registry, collectors and sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical group of operating-system processes observed together.
///
/// `id` and `collectors` are immutable once a job is admitted; `pids` only
/// ever shrinks as members die.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "JobID")]
    pub id: i64,
    #[serde(rename = "JobPIDs")]
    pub pids: Vec<i32>,
    #[serde(rename = "JobCreateTime")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "Lens")]
    pub collectors: Vec<String>,
}

impl Job {
    pub fn new(id: i64, pids: Vec<i32>, collectors: Vec<String>) -> Self {
        Self {
            id,
            pids,
            created_at: Utc::now(),
            collectors,
        }
    }
}

/// Lifecycle event broadcast by the job registry to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Added,
    Removed,
}

/// A named sampling strategy loaded once at startup from configuration.
#[derive(Debug, Clone)]
pub struct CollectorDescriptor {
    pub name: String,
    pub kind: String,
    pub config: serde_yaml::Value,
}

/// Per-process metrics produced by the proc collector on each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcSample {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub pid: i32,
    pub name: String,
    pub ppid: i32,
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f64,
    #[serde(rename = "memoryRss")]
    pub memory_rss: u64,
    #[serde(rename = "memoryPercent")]
    pub memory_percent: f64,
    #[serde(rename = "numThreads")]
    pub num_threads: u32,
    #[serde(rename = "ioReadCount")]
    pub io_read_count: u64,
    #[serde(rename = "ioWriteCount")]
    pub io_write_count: u64,
    #[serde(rename = "netConnCount")]
    pub net_conn_count: u32,
    pub status: String,
}

/// Polymorphic payload produced by a collector tick, tagged by collector
/// kind so sinks can dispatch exhaustively instead of downcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectorPayload {
    Proc(Vec<ProcSample>),
}

/// One record handed to every registered sink finish-callback.
#[derive(Debug, Clone)]
pub struct SamplingRecord {
    pub collector_name: String,
    pub job: Job,
    pub payload: CollectorPayload,
    pub timestamp: DateTime<Utc>,
}

/// Time-bounded claim on the master role, persisted in a shared lease file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub epoch: u64,
    pub updated_at_ms: u64,
    pub expire_at_ms: u64,
    pub snapshot: serde_json::Value,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            epoch: 0,
            updated_at_ms: 0,
            expire_at_ms: 0,
            snapshot: serde_json::Value::Null,
        }
    }
}
