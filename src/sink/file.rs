// jobsentry: local file sink — appends one framed record per line

use super::SinkBackend;
use crate::model::SamplingRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl SinkBackend for FileSink {
    fn flush(&mut self, batch: &[SamplingRecord]) {
        for record in batch {
            let line = serde_json::json!({
                "@timestamp": record.timestamp.to_rfc3339(),
                "collector_name": record.collector_name,
                "job_id": record.job.id,
                "data": &record.payload,
            });
            if let Err(e) = writeln!(self.writer, "{line}") {
                tracing::warn!(error = %e, "file sink: write failed, dropping record");
                return;
            }
        }
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "file sink: flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectorPayload, Job, ProcSample};

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.ndjson");
        let mut sink = FileSink::open(path.to_str().expect("utf8 path")).expect("open sink");

        let record = SamplingRecord {
            collector_name: "proc".to_string(),
            job: Job::new(1, vec![1234], vec!["proc".to_string()]),
            payload: CollectorPayload::Proc(vec![ProcSample {
                kind: "proc",
                pid: 1234,
                name: "test".to_string(),
                ppid: 1,
                cpu_percent: 0.0,
                memory_rss: 0,
                memory_percent: 0.0,
                num_threads: 1,
                io_read_count: 0,
                io_write_count: 0,
                net_conn_count: 0,
                status: "S".to_string(),
            }]),
            timestamp: chrono::Utc::now(),
        };
        sink.flush(std::slice::from_ref(&record));
        sink.flush(std::slice::from_ref(&record));

        let content = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(content.lines().count(), 2);
    }
}
