// jobsentry: bulk HTTP sink — batches records into a bulk-indexing request

use super::SinkBackend;
use crate::error::AgentError;
use crate::model::{CollectorPayload, SamplingRecord};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IndexMapping {
    pub collector_name: String,
    pub index_name: String,
}

pub struct HttpSinkOptions {
    pub host: String,
    pub port: u16,
    pub index_prefix: String,
    pub batch_size: usize,
    pub write_timeout: Duration,
    pub indexs: Vec<IndexMapping>,
}

/// Bulk HTTP sink backend. The batching itself lives one level up: the
/// owning `WriterPipeline`'s front buffer is sized to `batch_size`, so the
/// pipeline's own capacity threshold *is* the local pre-batch described by
/// the original writer's two-stage buffering — there is nothing left for
/// this backend to batch beyond what the pipeline already hands it in
/// `flush`.
pub struct HttpSink {
    client: reqwest::blocking::Client,
    base_url: String,
    options: HttpSinkOptions,
}

impl HttpSink {
    /// Probes `/` with HEAD at construction; a non-2xx response or a
    /// connect failure is fatal (`SinkReadinessFailed`), matching the
    /// original writer's construction-time readiness check.
    pub fn new(options: HttpSinkOptions) -> Result<Self, AgentError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.write_timeout)
            .build()
            .map_err(|e| AgentError::SinkReadinessFailed(e.to_string()))?;
        let base_url = format!("http://{}:{}", options.host, options.port);

        let probe = client
            .head(&base_url)
            .send()
            .map_err(|e| AgentError::SinkReadinessFailed(e.to_string()))?;
        if !probe.status().is_success() {
            return Err(AgentError::SinkReadinessFailed(format!(
                "readiness probe returned {}",
                probe.status()
            )));
        }

        Ok(Self {
            client,
            base_url,
            options,
        })
    }

    fn index_name(&self, collector_name: &str) -> String {
        self.options
            .indexs
            .iter()
            .find(|m| m.collector_name == collector_name)
            .map(|m| m.index_name.clone())
            .unwrap_or_else(|| format!("{}_{}", self.options.index_prefix, collector_name))
    }

    fn bulk_body(&self, batch: &[SamplingRecord]) -> String {
        let mut body = String::new();
        for record in batch {
            let index = self.index_name(&record.collector_name);
            let action = serde_json::json!({ "index": { "_index": index } });
            body.push_str(&action.to_string());
            body.push('\n');

            let data = match &record.payload {
                CollectorPayload::Proc(samples) => serde_json::to_value(samples).unwrap_or(serde_json::Value::Null),
            };
            let doc = serde_json::json!({
                "@timestamp": record.timestamp.to_rfc3339(),
                "collector_name": record.collector_name,
                "hostname": hostname(),
                "data": data,
            });
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        body
    }
}

impl SinkBackend for HttpSink {
    fn flush(&mut self, batch: &[SamplingRecord]) {
        if batch.is_empty() {
            return;
        }
        let body = self.bulk_body(batch);
        let url = format!("{}/_bulk", self.base_url);
        match self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
        {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "bulk http sink: non-2xx response, dropping batch");
            }
            Err(e) => {
                tracing::warn!(error = %e, "bulk http sink: request failed, dropping batch");
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        let mut buf = [0u8; 256];
        unsafe {
            if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
                let cstr = std::ffi::CStr::from_ptr(buf.as_ptr() as *const libc::c_char);
                return cstr.to_string_lossy().into_owned();
            }
        }
        "unknown".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;

    #[test]
    fn index_name_falls_back_to_prefix() {
        let options = HttpSinkOptions {
            host: "127.0.0.1".to_string(),
            port: 9999,
            index_prefix: "agent".to_string(),
            batch_size: 10,
            write_timeout: Duration::from_secs(1),
            indexs: vec![IndexMapping {
                collector_name: "proc".to_string(),
                index_name: "custom_proc_index".to_string(),
            }],
        };
        // Constructing directly to unit-test index resolution without a
        // live server: bypass `new`'s readiness probe.
        let sink = HttpSink {
            client: reqwest::blocking::Client::new(),
            base_url: "http://127.0.0.1:9999".to_string(),
            options,
        };
        assert_eq!(sink.index_name("proc"), "custom_proc_index");
        assert_eq!(sink.index_name("other"), "agent_other");
    }

    #[test]
    fn bulk_body_has_two_lines_per_record() {
        let options = HttpSinkOptions {
            host: "127.0.0.1".to_string(),
            port: 9999,
            index_prefix: "agent".to_string(),
            batch_size: 10,
            write_timeout: Duration::from_secs(1),
            indexs: vec![],
        };
        let sink = HttpSink {
            client: reqwest::blocking::Client::new(),
            base_url: "http://127.0.0.1:9999".to_string(),
            options,
        };
        let record = SamplingRecord {
            collector_name: "proc".to_string(),
            job: Job::new(1, vec![1], vec!["proc".to_string()]),
            payload: CollectorPayload::Proc(vec![]),
            timestamp: chrono::Utc::now(),
        };
        let body = sink.bulk_body(&[record.clone(), record]);
        assert_eq!(body.lines().count(), 4);
    }
}
