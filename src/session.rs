//! Run identity and artifacts layout: one directory per test id, holding the
//! per-stream data files, `jobno.log` and (after shutdown) the runtime log.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, VoltaError};

pub struct DataSession {
    pub test_id: String,
    pub key_date: String,
    pub operator: String,
    pub artifacts_dir: PathBuf,
}

impl DataSession {
    /// Establishes the run identity from the (dynamic-option-filled) config
    /// and creates the world-readable artifacts directory.
    pub fn new(config: &Config) -> Result<DataSession> {
        let test_id = config
            .core
            .test_id
            .clone()
            .ok_or_else(|| VoltaError::Config("core.test_id not set".into()))?;
        let key_date = config
            .core
            .key_date
            .clone()
            .ok_or_else(|| VoltaError::Config("core.key_date not set".into()))?;
        let operator = config
            .core
            .operator
            .clone()
            .ok_or_else(|| VoltaError::Config("core.operator not set".into()))?;
        let artifacts_dir = PathBuf::from(&config.data_session.artifacts_base_dir).join(&test_id);
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&artifacts_dir)?;
        info!(%test_id, artifacts = %artifacts_dir.display(), "data session started");
        Ok(DataSession {
            test_id,
            key_date,
            operator,
            artifacts_dir,
        })
    }

    /// Moves the runtime log into the artifacts directory. Best effort: a
    /// failure is logged, never fatal.
    pub fn relocate_log(&self, log_path: &Path) {
        let Some(name) = log_path.file_name() else {
            return;
        };
        let target = self.artifacts_dir.join(name);
        if let Err(e) = fs::rename(log_path, &target) {
            // cross-device moves need a copy
            match fs::copy(log_path, &target).and_then(|_| fs::remove_file(log_path)) {
                Ok(_) => {}
                Err(_) => warn!(error = %e, "failed to move logfile to artifacts dir"),
            }
        }
    }
}
