// jobsentry: framed job-command protocol carried over the stream watcher

use crate::job_registry::JobRegistry;
use crate::model::Job;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RawCommand {
    opt: String,
    #[serde(rename = "JobID")]
    job_id: i64,
    #[serde(rename = "JobPIDs", default)]
    pids: Vec<i32>,
    #[serde(rename = "Lens", default)]
    collectors: Vec<String>,
}

/// Applies one or more newline-delimited JSON command frames to the
/// registry. Malformed lines are logged and skipped rather than aborting
/// the whole buffer, since a single watcher buffer may straddle frames
/// from multiple writers.
pub fn apply_frames(registry: &JobRegistry, buf: &[u8]) {
    for line in buf.split(|&b| b == b'\n') {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<RawCommand>(line) {
            Ok(cmd) => apply_one(registry, cmd),
            Err(e) => tracing::warn!(error = %e, "job command: malformed frame, skipping"),
        }
    }
}

fn apply_one(registry: &JobRegistry, cmd: RawCommand) {
    match cmd.opt.as_str() {
        "add" => {
            let job = Job::new(cmd.job_id, cmd.pids, cmd.collectors);
            if let Err(e) = registry.add(job) {
                tracing::warn!(job_id = cmd.job_id, error = %e, "job command: add rejected");
            }
        }
        "remove" => {
            if registry.remove(cmd.job_id).is_none() {
                tracing::warn!(job_id = cmd.job_id, "job command: remove of unknown job");
            }
        }
        other => tracing::warn!(opt = other, "job command: unknown opt"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_command_registers_job() {
        let registry = JobRegistry::new();
        let frame = format!(
            r#"{{"opt":"add","JobID":7,"JobPIDs":[{}],"Lens":["proc"]}}"#,
            std::process::id()
        );
        apply_frames(&registry, frame.as_bytes());
        assert!(registry.find(7).is_some());
    }

    #[test]
    fn remove_command_unregisters_job() {
        let registry = JobRegistry::new();
        registry.add(Job::new(8, vec![std::process::id() as i32], vec!["proc".to_string()])).unwrap();
        apply_frames(&registry, br#"{"opt":"remove","JobID":8}"#);
        assert!(registry.find(8).is_none());
    }

    #[test]
    fn malformed_frame_is_skipped_not_fatal() {
        let registry = JobRegistry::new();
        apply_frames(&registry, b"not json\n{\"opt\":\"remove\",\"JobID\":1}");
        assert_eq!(registry.len(), 0);
    }
}
