//! Orchestrator: resolves the box and phone implementations from the
//! config, wires the channels between sources, router and sinks, and drives
//! the test lifecycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info, warn};

use crate::boxes::VoltaBox;
use crate::config::Config;
use crate::error::Result;
use crate::event::{EventKind, Record};
use crate::phones::Phone;
use crate::router::EventsRouter;
use crate::session::DataSession;
use crate::sinks::{ConsoleSink, DataUploader, FileSink, UploadWorker, UploaderConfig};
use crate::sync::{find_sync_points, SyncCollector, SyncPoints};

/// Every non-daemon thread is expected to stop within this long of
/// `end_test`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the config type tags to implementations, with an exhaustive match
/// inside each constructor.
pub struct Factory;

impl Factory {
    pub fn detect_volta(config: &Config) -> Result<VoltaBox> {
        let volta = VoltaBox::new(&config.volta)?;
        debug!(r#type = %config.volta.r#type, "volta box detected");
        Ok(volta)
    }

    pub fn detect_phone(config: &Config) -> Result<Phone> {
        let phone = Phone::new(&config.phone)?;
        debug!(r#type = %config.phone.r#type, "phone detected");
        Ok(phone)
    }
}

/// The test performer. Owns one box, one phone, the router, the sync
/// collector and the sinks; `configure → start_test → end_test →
/// post_process`.
pub struct Core {
    config: Config,
    pub session: DataSession,
    volta: Option<VoltaBox>,
    phone: Option<Phone>,
    uploader: Option<DataUploader>,
    upload_worker: Option<UploadWorker>,
    router: Option<EventsRouter>,
    sync_collector: Option<SyncCollector>,
    file_sink: Option<FileSink>,
    console_sink: Option<ConsoleSink>,
    pub sync_points: Option<SyncPoints>,
    started_at: Option<Instant>,
}

impl Core {
    pub fn new(config: Config) -> Result<Core> {
        let session = DataSession::new(&config)?;
        Ok(Core {
            config,
            session,
            volta: None,
            phone: None,
            uploader: None,
            upload_worker: None,
            router: None,
            sync_collector: None,
            file_sink: None,
            console_sink: None,
            sync_points: None,
            started_at: None,
        })
    }

    /// Constructs the enabled modules and prepares the phone. Any error here
    /// is fatal: nothing has started yet.
    pub fn configure(&mut self) -> Result<()> {
        debug!("configure stage");
        if self.config.volta.enabled {
            self.volta = Some(Factory::detect_volta(&self.config)?);
        }
        if self.config.phone.enabled {
            let mut phone = Factory::detect_phone(&self.config)?;
            phone.prepare()?;
            self.phone = Some(phone);
        }
        if self.config.uploader.enabled {
            let mut uploader = DataUploader::new(self.uploader_config());
            uploader.create_job(&self.session.artifacts_dir)?;
            self.uploader = Some(uploader);
        }
        Ok(())
    }

    fn uploader_config(&self) -> UploaderConfig {
        let section = &self.config.uploader;
        UploaderConfig {
            address: section.address.clone(),
            task: section.task.clone(),
            create_job_url: section.create_job_url.clone(),
            update_job_url: section.update_job_url.clone(),
            component: section.component.clone(),
            test_id: self.session.test_id.clone(),
            key_date: self.session.key_date.clone(),
            operator: self.session.operator.clone(),
            version: self.config.core.version.clone().unwrap_or_default(),
        }
    }

    /// Starts the grabbers and routes data to the listeners.
    pub fn start_test(&mut self) -> Result<()> {
        info!("starting test");
        self.started_at = Some(Instant::now());

        // handshake first: the sync capacity and the chopper depend on the
        // authoritative sample rate
        let sample_rate = match self.volta.as_mut() {
            Some(volta) => {
                volta.prepare()?;
                volta.sample_rate
            }
            None => 0,
        };

        let mut currents_listeners: Vec<Sender<Record>> = Vec::new();
        let mut destinations: HashMap<EventKind, Vec<Sender<Record>>> = HashMap::new();

        if self.config.data_session.enabled {
            let (tx, rx) = unbounded();
            self.file_sink = Some(FileSink::spawn(rx, self.session.artifacts_dir.clone()));
            currents_listeners.push(tx.clone());
            for kind in EventKind::ALL {
                destinations.entry(kind).or_default().push(tx.clone());
            }
        }
        if let Some(uploader) = &self.uploader {
            let (tx, rx) = unbounded();
            self.upload_worker = Some(uploader.spawn_worker(rx));
            currents_listeners.push(tx.clone());
            for kind in EventKind::ALL {
                destinations.entry(kind).or_default().push(tx.clone());
            }
        }
        if self.config.sync.enabled && sample_rate > 0 {
            let capacity = self.config.sync.search_interval as usize * sample_rate as usize;
            let (tx, rx) = unbounded();
            self.sync_collector = Some(SyncCollector::spawn(rx, capacity));
            currents_listeners.push(tx.clone());
            destinations.entry(EventKind::Sync).or_default().push(tx);
        }
        if self.config.console.enabled {
            let (tx, rx) = unbounded();
            self.console_sink = Some(ConsoleSink::spawn(rx));
            currents_listeners.push(tx);
        }

        if let Some(volta) = self.volta.as_mut() {
            volta.start_test(currents_listeners)?;
        }
        if let Some(phone) = self.phone.as_mut() {
            let (phone_tx, phone_rx) = unbounded();
            self.router = Some(EventsRouter::spawn(phone_rx, destinations));
            phone.start(phone_tx)?;
            info!("starting test apps and waiting for finish");
            phone.run_test()?;
        }
        Ok(())
    }

    /// True once the configured on-device test has exited. A run without a
    /// test performer only ends on interrupt.
    pub fn test_finished(&mut self) -> bool {
        self.phone
            .as_mut()
            .and_then(Phone::test_finished)
            .unwrap_or(false)
    }

    /// Stops the grabbers and parsers; sources first.
    pub fn end_test(&mut self) {
        info!("stopping test");
        if let Some(volta) = self.volta.as_mut() {
            volta.end_test();
        }
        if let Some(phone) = self.phone.as_mut() {
            phone.end();
        }
    }

    /// Drains the router, computes the sync points, updates the backend job
    /// and closes the sinks in registration order.
    pub fn post_process(&mut self) {
        info!("post process");
        let mut stragglers: Vec<&str> = Vec::new();

        if let Some(router) = self.router.as_mut() {
            router.close();
            if !router.wait(SHUTDOWN_TIMEOUT) {
                stragglers.push("events-router");
            }
        }
        if let Some(collector) = self.sync_collector.take() {
            collector.close();
            let buffers = collector.join();
            let sample_rate = self.volta.as_ref().map(|v| v.sample_rate).unwrap_or(0);
            match find_sync_points(&buffers, sample_rate, self.config.sync.search_interval) {
                Ok(points) => {
                    info!(?points, "sync points found");
                    self.sync_points = Some(points);
                }
                Err(e) => warn!(error = %e, "failed to calculate sync points"),
            }
        }

        if let Some(sink) = self.file_sink.as_mut() {
            sink.close();
        }
        if let Some(worker) = self.upload_worker.as_mut() {
            worker.close();
        }
        if let Some(uploader) = self.uploader.as_ref() {
            if let Err(e) = uploader.update_job(&self.job_meta()) {
                warn!(error = %e, "failed to update backend job");
            }
        }
        if let Some(sink) = self.console_sink.as_mut() {
            sink.close();
        }

        if !stragglers.is_empty() {
            warn!(?stragglers, "threads still running after shutdown");
        }
        if let Some(started) = self.started_at {
            let elapsed = Duration::from_secs(started.elapsed().as_secs());
            info!(elapsed = %humantime::format_duration(elapsed), "finished");
        }
    }

    /// The full metadata dictionary for the update-job call. Sync offsets
    /// stay absent (null on the backend) when sync was infeasible.
    fn job_meta(&self) -> Vec<(String, String)> {
        let section = &self.config.uploader;
        let mut meta: Vec<(String, String)> = Vec::new();
        for (name, value) in [
            ("name", &section.name),
            ("dsc", &section.dsc),
            ("device_id", &section.device_id),
            ("device_model", &section.device_model),
            ("device_os", &section.device_os),
            ("app", &section.app),
            ("ver", &section.ver),
            ("meta", &section.meta),
        ] {
            if let Some(value) = value {
                meta.push((name.to_string(), value.clone()));
            }
        }
        meta.push(("task".into(), section.task.clone()));
        meta.push(("person".into(), self.session.operator.clone()));
        if let Some(points) = &self.sync_points {
            meta.push(("sys_uts_offset".into(), points.sys_uts_offset.to_string()));
            if let Some(log_offset) = points.log_uts_offset {
                meta.push(("log_uts_offset".into(), log_offset.to_string()));
            }
            meta.push(("sync_sample".into(), points.sync_sample.to_string()));
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(artifacts: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.core.test_id = Some("test-run".into());
        config.core.key_date = Some("2024-06-15".into());
        config.core.operator = Some("tester".into());
        config.data_session.artifacts_base_dir = artifacts.display().to_string();
        config
    }

    #[test]
    fn lifecycle_with_everything_disabled_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = Core::new(minimal_config(dir.path())).unwrap();
        core.configure().unwrap();
        core.start_test().unwrap();
        assert!(!core.test_finished());
        core.end_test();
        core.post_process();
        assert!(core.sync_points.is_none());
    }

    #[test]
    fn file_sink_spins_up_with_data_session_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal_config(dir.path());
        config.data_session.enabled = true;
        let mut core = Core::new(config).unwrap();
        core.configure().unwrap();
        core.start_test().unwrap();
        core.end_test();
        core.post_process();
        // no data flowed; the artifacts dir exists and is empty of streams
        assert!(core.session.artifacts_dir.exists());
    }
}
