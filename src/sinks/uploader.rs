//! Uploader sink: batches frames and events per kind and POSTs them as TSV
//! to the backend, and manages the backend job record for the run.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::error::{Result, VoltaError};
use crate::event::Record;
use crate::sinks::event_row;

const JOBNO_FNAME: &str = "jobno.log";
const BATCH_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the uploader needs, resolved from the config and the data
/// session at startup.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub address: String,
    pub task: String,
    pub create_job_url: String,
    pub update_job_url: String,
    pub component: String,
    pub test_id: String,
    pub key_date: String,
    pub operator: String,
    pub version: String,
}

fn table_for(stream: &str) -> &'static str {
    match stream {
        "currents" => "volta.currents",
        "sync" => "volta.syncs",
        "event" => "volta.events",
        "metric" => "volta.metrics",
        "fragment" => "volta.fragments",
        _ => "volta.logentries",
    }
}

/// Scheme plus authority of a URL, the base for the job endpoints.
fn hostname_of(address: &str) -> String {
    match address.find("://") {
        Some(scheme_end) => {
            let rest = &address[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => address[..scheme_end + 3 + path_start].to_string(),
                None => address.to_string(),
            }
        }
        None => address.to_string(),
    }
}

/// Job lifecycle client plus the factory for the batching worker.
pub struct DataUploader {
    cfg: UploaderConfig,
    hostname: String,
    agent: ureq::Agent,
    pub jobno: Option<i64>,
}

impl DataUploader {
    pub fn new(cfg: UploaderConfig) -> DataUploader {
        let hostname = hostname_of(&cfg.address);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        DataUploader {
            cfg,
            hostname,
            agent,
            jobno: None,
        }
    }

    /// Registers the run with the backend and records the report URL in
    /// `jobno.log` inside the artifacts directory.
    pub fn create_job(&mut self, artifacts_dir: &Path) -> Result<()> {
        let url = format!("{}{}", self.hostname, self.cfg.create_job_url);
        let fields: [(&str, &str); 6] = [
            ("key_date", &self.cfg.key_date),
            ("test_id", &self.cfg.test_id),
            ("version", &self.cfg.version),
            ("task", &self.cfg.task),
            ("person", &self.cfg.operator),
            ("component", &self.cfg.component),
        ];
        let response = self
            .agent
            .post(&url)
            .send_form(&fields)
            .map_err(|e| VoltaError::Transport(format!("create job failed: {e}")))?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| VoltaError::Transport(format!("create job response unreadable: {e}")))?;
        if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(VoltaError::Resource(format!(
                "backend job not created: {}",
                body.get("error").cloned().unwrap_or_default()
            )));
        }
        let jobno = body
            .get("jobno")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| VoltaError::Resource("create job response missing jobno".into()))?;
        self.jobno = Some(jobno);
        let report_url = format!("{}/mobile/{}", self.hostname, jobno);
        info!(jobno, %report_url, "backend job created");
        if let Err(e) = fs::write(artifacts_dir.join(JOBNO_FNAME), &report_url) {
            warn!(error = %e, "failed to dump jobno to file");
        }
        Ok(())
    }

    /// Pushes the full run metadata (including sync offsets) to the backend.
    pub fn update_job(&self, data: &[(String, String)]) -> Result<()> {
        let url = format!("{}{}", self.hostname, self.cfg.update_job_url);
        let fields: Vec<(&str, &str)> = data
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.agent
            .post(&url)
            .send_form(&fields)
            .map_err(|e| VoltaError::Transport(format!("update job failed: {e}")))?;
        debug!("backend job updated");
        Ok(())
    }

    /// Spawns the batching worker consuming `source`.
    pub fn spawn_worker(&self, source: Receiver<Record>) -> UploadWorker {
        UploadWorker::spawn(
            source,
            BatchSender {
                agent: self.agent.clone(),
                address: self.cfg.address.clone(),
                test_id: self.cfg.test_id.clone(),
                key_date: self.cfg.key_date.clone(),
            },
        )
    }
}

struct BatchSender {
    agent: ureq::Agent,
    address: String,
    test_id: String,
    key_date: String,
}

impl BatchSender {
    /// Drains the queue, groups rows by kind and POSTs one TSV body per
    /// kind. Every row is tagged with the run's key date and test id.
    fn drain_and_send(&self, source: &Receiver<Record>) {
        let mut bodies: HashMap<&'static str, String> = HashMap::new();
        for record in source.try_iter() {
            match record {
                Record::Currents(frame) => {
                    let body = bodies.entry("currents").or_default();
                    for (ts, value) in frame.ts.iter().zip(&frame.values) {
                        body.push_str(&format!(
                            "{}\t{}\t{ts}\t{value}\n",
                            self.key_date, self.test_id
                        ));
                    }
                }
                Record::Events(kind, batch) => {
                    let body = bodies.entry(kind.as_str()).or_default();
                    for event in batch.iter() {
                        body.push_str(&format!(
                            "{}\t{}\t{}\n",
                            self.key_date,
                            self.test_id,
                            event_row(kind, event)
                        ));
                    }
                }
            }
        }
        for (stream, body) in bodies {
            if !body.is_empty() {
                self.send_chunk(table_for(stream), &body);
            }
        }
    }

    /// One POST with a single retry on transport failure; a failed retry or
    /// a bad status drops the batch with a warning, never propagates.
    fn send_chunk(&self, table: &str, body: &str) {
        let query = format!("INSERT INTO {table} FORMAT TSV");
        let attempt = || {
            self.agent
                .post(&self.address)
                .query("query", &query)
                .send_string(body)
        };
        match attempt() {
            Ok(_) => debug!(table, bytes = body.len(), "batch uploaded"),
            Err(ureq::Error::Status(code, response)) => {
                warn!(
                    table,
                    code,
                    error = response.into_string().unwrap_or_default(),
                    "upload rejected, batch dropped"
                );
            }
            Err(ureq::Error::Transport(e)) => {
                debug!(table, error = %e, "connection error, retrying in 1s");
                thread::sleep(RETRY_BACKOFF);
                if let Err(e) = attempt() {
                    warn!(table, error = %e, "failed retrying upload, batch dropped");
                }
            }
        }
    }
}

/// The batching worker thread: wakes every 500 ms, drains the queue and
/// uploads; one last drain cycle runs after close.
pub struct UploadWorker {
    interrupt: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UploadWorker {
    fn spawn(source: Receiver<Record>, sender: BatchSender) -> UploadWorker {
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let handle = thread::Builder::new()
            .name("uploader-worker".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(BATCH_INTERVAL);
                while !flag.load(Ordering::SeqCst) {
                    let _ = ticker.recv();
                    sender.drain_and_send(&source);
                }
                debug!("uploader interrupted, sending the rest of the data");
                sender.drain_and_send(&source);
            })
            .expect("failed to spawn uploader worker thread");
        UploadWorker {
            interrupt,
            handle: Some(handle),
        }
    }

    /// Stops the worker after a final drain cycle.
    pub fn close(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("uploader finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_strips_path() {
        assert_eq!(
            hostname_of("https://backend.example.com/api/volta"),
            "https://backend.example.com"
        );
        assert_eq!(
            hostname_of("http://localhost:8123"),
            "http://localhost:8123"
        );
    }

    #[test]
    fn tables_cover_every_stream() {
        assert_eq!(table_for("currents"), "volta.currents");
        assert_eq!(table_for("sync"), "volta.syncs");
        assert_eq!(table_for("metric"), "volta.metrics");
        assert_eq!(table_for("unknown"), "volta.logentries");
    }
}
