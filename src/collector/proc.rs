// jobsentry: the Linux /proc-backed collector

use super::Collector;
use crate::error::AgentError;
use crate::model::{CollectorPayload, Job, ProcSample};
use std::collections::HashMap;
use std::fs;
use std::io;

/// Per-pid jiffy counters retained across ticks so CPU percent can be
/// computed as a rate rather than a cumulative total.
#[derive(Clone, Copy, Default)]
struct PidState {
    last_system_total: u64,
    last_proc_jiffies: u64,
}

pub struct ProcCollector {
    mem_total_kb: Option<u64>,
    page_size: u64,
    online_cpus: u64,
    state: HashMap<i32, PidState>,
}

impl ProcCollector {
    pub fn new() -> Self {
        Self {
            mem_total_kb: None,
            page_size: sysconf_page_size(),
            online_cpus: sysconf_online_cpus(),
            state: HashMap::new(),
        }
    }

    fn mem_total_kb(&mut self) -> io::Result<u64> {
        if let Some(v) = self.mem_total_kb {
            return Ok(v);
        }
        let content = fs::read_to_string("/proc/meminfo")?;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad MemTotal line"))?;
                self.mem_total_kb = Some(kb);
                return Ok(kb);
            }
        }
        Err(io::Error::new(io::ErrorKind::InvalidData, "MemTotal not found"))
    }

    fn snapshot_of(&mut self, pid: i32) -> io::Result<ProcSample> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
        let (name, rest_after_name) = parse_comm(&stat)?;
        let fields: Vec<&str> = rest_after_name.split_whitespace().collect();
        // fields[0] is state (field 3 overall), fields[1] is ppid (field 4).
        let state = fields.first().copied().unwrap_or("?").to_string();
        let ppid: i32 = fields.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        // utime is field 14, stime field 15; ppid is field 4 -> index 1 here,
        // so utime is index 1 + (14-4) = 11, stime index 12.
        let utime: u64 = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
        let stime: u64 = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
        let proc_jiffies = utime + stime;

        let statm = fs::read_to_string(format!("/proc/{pid}/statm"))?;
        let rss_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let memory_rss = rss_pages * self.page_size;

        let status = fs::read_to_string(format!("/proc/{pid}/status"))?;
        let mut vmrss_kb: u64 = 0;
        let mut num_threads: u32 = 0;
        for line in status.lines() {
            if line.starts_with("VmRSS:") {
                vmrss_kb = line
                    .trim_start_matches("VmRSS:")
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
            } else if line.starts_with("Threads:") {
                num_threads = line
                    .trim_start_matches("Threads:")
                    .trim()
                    .parse()
                    .unwrap_or(0);
            }
        }
        let mem_total_kb = self.mem_total_kb().unwrap_or(1);
        let memory_percent = 100.0 * vmrss_kb as f64 / mem_total_kb as f64;

        let (mut io_read, mut io_write) = (0u64, 0u64);
        if let Ok(io_stat) = fs::read_to_string(format!("/proc/{pid}/io")) {
            for line in io_stat.lines() {
                if let Some(rest) = line.strip_prefix("read_bytes:") {
                    io_read = rest.trim().parse().unwrap_or(0);
                } else if let Some(rest) = line.strip_prefix("write_bytes:") {
                    io_write = rest.trim().parse().unwrap_or(0);
                }
            }
        }

        let net_conn_count = count_socket_fds(pid).unwrap_or(0);

        let system_total = read_system_total_jiffies().unwrap_or(0);
        let prior = self.state.get(&pid).copied().unwrap_or_default();
        let cpu_percent = if prior.last_system_total == 0 {
            0.0
        } else {
            let delta_total = system_total.saturating_sub(prior.last_system_total);
            let delta_proc = proc_jiffies.saturating_sub(prior.last_proc_jiffies);
            if delta_total == 0 {
                0.0
            } else {
                // Preserves the observed formula, online_cpus factor
                // included, rather than correcting the apparent
                // double-count on multi-core systems.
                100.0 * delta_proc as f64 / delta_total as f64 * self.online_cpus as f64
            }
        };
        self.state.insert(
            pid,
            PidState {
                last_system_total: system_total,
                last_proc_jiffies: proc_jiffies,
            },
        );

        Ok(ProcSample {
            kind: "proc",
            pid,
            name,
            ppid,
            cpu_percent,
            memory_rss,
            memory_percent,
            num_threads,
            io_read_count: io_read,
            io_write_count: io_write,
            net_conn_count,
            status: state,
        })
    }
}

impl Default for ProcCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ProcCollector {
    fn init(&mut self, _config: &serde_yaml::Value) -> Result<(), AgentError> {
        Ok(())
    }

    fn collect(&mut self, job: &Job) -> Result<CollectorPayload, AgentError> {
        let mut samples = Vec::with_capacity(job.pids.len());
        for &pid in &job.pids {
            if pid <= 0 {
                continue;
            }
            match self.snapshot_of(pid) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    tracing::debug!(pid, error = %e, "proc collector: transient read failure, skipping pid");
                    continue;
                }
            }
        }
        Ok(CollectorPayload::Proc(samples))
    }

    fn deinit(&mut self) {}
}

/// `/proc/<pid>/stat` field 2 is the command name, parenthesized and
/// possibly containing spaces or further parens; split on the *last* `)` to
/// recover it unambiguously, then return the remaining fields as one str.
fn parse_comm(stat: &str) -> io::Result<(String, &str)> {
    let open = stat.find('(').ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no ("))?;
    let close = stat.rfind(')').ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no )"))?;
    if close <= open {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed stat comm"));
    }
    let name = stat[open + 1..close].to_string();
    let rest = stat[close + 1..].trim_start();
    Ok((name, rest))
}

fn read_system_total_jiffies() -> io::Result<u64> {
    let content = fs::read_to_string("/proc/stat")?;
    let first = content
        .lines()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty /proc/stat"))?;
    let total: u64 = first
        .split_whitespace()
        .skip(1)
        .filter_map(|s| s.parse::<u64>().ok())
        .sum();
    Ok(total)
}

fn count_socket_fds(pid: i32) -> io::Result<u32> {
    let dir = fs::read_dir(format!("/proc/{pid}/fd"))?;
    let mut count = 0;
    for entry in dir.flatten() {
        if let Ok(target) = fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("socket:[") {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn sysconf_page_size() -> u64 {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v > 0 {
        v as u64
    } else {
        4096
    }
}

fn sysconf_online_cpus() -> u64 {
    let v = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if v > 0 {
        v as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comm_with_spaces_and_parens() {
        let stat = "1234 (my cool (proc)) S 1 1234 1234 0 -1 4194304 100 0 0 0 5 3 0 0 20 0 1 0 1000 4096000 100 18446744073709551615 ";
        let (name, rest) = parse_comm(stat).unwrap();
        assert_eq!(name, "my cool (proc)");
        assert!(rest.starts_with("S "));
    }

    #[test]
    fn first_sample_cpu_percent_is_zero() {
        let mut collector = ProcCollector::new();
        let job = Job::new(1, vec![std::process::id() as i32], vec!["proc".to_string()]);
        let payload = collector.collect(&job).unwrap();
        let CollectorPayload::Proc(samples) = payload;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].cpu_percent, 0.0);
    }

    #[test]
    fn skips_nonexistent_pid_without_failing() {
        let mut collector = ProcCollector::new();
        let job = Job::new(2, vec![999_999], vec!["proc".to_string()]);
        let payload = collector.collect(&job).unwrap();
        let CollectorPayload::Proc(samples) = payload;
        assert!(samples.is_empty());
    }
}
