//! Phone providers: probe the device, set up the apps, stream the platform
//! log through the parser into the router and drive the on-device test.

pub mod process;

use std::time::Duration;

use crossbeam_channel::Sender;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::PhoneSection;
use crate::error::{Result, VoltaError};
use crate::event::LogEvent;
use crate::parser::{
    LogParser, Platform, ANDROID_THREADTIME_RE, ANDROID_TIME_RE, IOS_SYSLOG_RE, NEXUS4_RE,
};
use crate::pump::Drain;

pub use process::{run_command, PipedChild};

/// How long the flashlight app needs to finish its sync pattern.
const FLASHLIGHT_WAIT: Duration = Duration::from_secs(15);

/// Which phone integration to use. Selected by `phone.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneKind {
    /// Android ≥ 5, threadtime logcat format.
    Android,
    /// Android < 5, classic `-v time` format.
    AndroidOld,
    Iphone,
    Nexus4,
}

impl PhoneKind {
    pub fn from_config(s: &str) -> Result<PhoneKind> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(PhoneKind::Android),
            "android_old" => Ok(PhoneKind::AndroidOld),
            "iphone" => Ok(PhoneKind::Iphone),
            "nexus4" => Ok(PhoneKind::Nexus4),
            other => Err(VoltaError::Config(format!("unknown phone type: {other}"))),
        }
    }

    pub fn platform(self) -> Platform {
        match self {
            PhoneKind::Android | PhoneKind::AndroidOld | PhoneKind::Nexus4 => Platform::Android,
            PhoneKind::Iphone => Platform::Ios,
        }
    }

    /// Each variant gets its own compiled pattern; in particular the old
    /// Android format must not share the threadtime regex.
    pub fn default_line_regex(self) -> &'static str {
        match self {
            PhoneKind::Android => ANDROID_THREADTIME_RE,
            PhoneKind::AndroidOld => ANDROID_TIME_RE,
            PhoneKind::Nexus4 => NEXUS4_RE,
            PhoneKind::Iphone => IOS_SYSLOG_RE,
        }
    }

    fn is_android(self) -> bool {
        self != PhoneKind::Iphone
    }
}

/// Validates the liveness probe output. An unknown or unauthorized device,
/// or anything on stderr, aborts the run.
fn check_probe_output(source: &str, stdout: &str, stderr: &str) -> Result<()> {
    let state = stdout.trim();
    if state == "unknown" || state == "unauthorized" {
        return Err(VoltaError::Resource(format!(
            "phone {source} has an unknown state, check device authorization"
        )));
    }
    if !stderr.trim().is_empty() {
        return Err(VoltaError::Resource(format!(
            "errors while testing connection to phone {source}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

pub struct Phone {
    kind: PhoneKind,
    cfg: PhoneSection,
    line_regex: Regex,
    worker: Option<PipedChild>,
    pipeline: Option<Drain>,
    test_performer: Option<PipedChild>,
}

impl Phone {
    /// Compiles the line regex and probes the device.
    pub fn new(cfg: &PhoneSection) -> Result<Phone> {
        let kind = PhoneKind::from_config(&cfg.r#type)?;
        let pattern = cfg
            .event_regexp
            .clone()
            .unwrap_or_else(|| kind.default_line_regex().to_string());
        let line_regex = Regex::new(&pattern)
            .map_err(|e| VoltaError::Config(format!("unable to parse event regexp: {e}")))?;
        let phone = Phone {
            kind,
            cfg: cfg.clone(),
            line_regex,
            worker: None,
            pipeline: None,
            test_performer: None,
        };
        phone.probe()?;
        Ok(phone)
    }

    fn cfgutil(&self) -> &str {
        self.cfg.util.as_deref().unwrap_or("cfgutil")
    }

    fn probe(&self) -> Result<()> {
        let cmd = if self.kind.is_android() {
            format!("adb -s {} get-state", self.cfg.source)
        } else {
            format!("{} -e {} list", self.cfgutil(), self.cfg.source)
        };
        let output = run_command(&cmd)?;
        check_probe_output(&self.cfg.source, &output.stdout, &output.stderr)?;
        info!(device = %self.cfg.source, "phone probe passed");
        Ok(())
    }

    /// One-shot adb command; a non-zero exit code is a resource error.
    fn adb_execution(&self, cmd: &str) -> Result<()> {
        let output = run_command(cmd)?;
        for line in output.stdout.lines() {
            debug!(cmd, line, "command output");
        }
        if !output.status.success() {
            return Err(VoltaError::Resource(format!(
                "failed to execute '{cmd}' on device {}: {}",
                self.cfg.source,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Installs the lightning and test apps and clears the device log.
    pub fn prepare(&mut self) -> Result<()> {
        if !self.kind.is_android() {
            return Ok(());
        }
        for app in &self.cfg.cleanup_apps {
            self.adb_execution(&format!("adb -s {} uninstall {app}", self.cfg.source))?;
        }
        if let Some(lightning) = self.cfg.lightning.clone() {
            let apk = crate::resource::local_copy(&lightning)?;
            info!("installing lightning apk");
            self.adb_execution(&format!(
                "adb -s {} install -r -d -t {}",
                self.cfg.source,
                apk.display()
            ))?;
        }
        for app in self.cfg.test_apps.clone() {
            let apk = crate::resource::local_copy(&app)?;
            self.adb_execution(&format!(
                "adb -s {} install -r -d -t {}",
                self.cfg.source,
                apk.display()
            ))?;
        }
        self.adb_execution(&format!("adb -s {} logcat -c", self.cfg.source))?;
        Ok(())
    }

    fn log_command(&self) -> String {
        match self.kind {
            PhoneKind::Android => format!("adb -s {} logcat", self.cfg.source),
            PhoneKind::AndroidOld | PhoneKind::Nexus4 => {
                format!("adb -s {} logcat -v time", self.cfg.source)
            }
            PhoneKind::Iphone => format!("{} -e {} syslog", self.cfgutil(), self.cfg.source),
        }
    }

    /// Starts the log pipeline and the flashlight sync pattern. Parsed
    /// events land on `results`.
    pub fn start(&mut self, results: Sender<LogEvent>) -> Result<()> {
        let worker = PipedChild::spawn(&self.log_command())?;
        let parser = LogParser::new(worker.stdout(), self.line_regex.clone(), self.kind.platform());
        self.pipeline = Some(Drain::spawn("log-parser", parser, vec![results]));
        self.worker = Some(worker);

        if self.kind.is_android() {
            if let Some(class) = &self.cfg.lightning_class {
                self.adb_execution(&format!(
                    "adb -s {} shell am start -n {class}/{class}.MainActivity",
                    self.cfg.source
                ))?;
                info!("waiting for the flashlight app to finish its sync pattern");
                std::thread::sleep(FLASHLIGHT_WAIT);
            }
        }
        Ok(())
    }

    /// Launches the instrumented test when one is configured; otherwise the
    /// run idles until an external interrupt.
    pub fn run_test(&mut self) -> Result<()> {
        if !self.kind.is_android() {
            return Ok(());
        }
        let Some(package) = &self.cfg.test_package else {
            info!("no test apps specified, waiting for interrupt");
            return Ok(());
        };
        let cmd = format!(
            "adb -s {} shell am instrument -w -e class {} {package}/{}",
            self.cfg.source,
            self.cfg.test_class.as_deref().unwrap_or_default(),
            self.cfg.test_runner.as_deref().unwrap_or_default()
        );
        info!(%cmd, "starting instrumented test");
        self.test_performer = Some(PipedChild::spawn(&cmd)?);
        Ok(())
    }

    /// Whether the configured on-device test has exited. `None` when the run
    /// has no test performer and only ends on interrupt.
    pub fn test_finished(&mut self) -> Option<bool> {
        self.test_performer
            .as_mut()
            .map(|child| child.try_wait().is_some())
    }

    /// Stops the log subprocess, the parser pipeline and the test, then
    /// uninstalls the cleanup apps. Best effort.
    pub fn end(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.close();
        }
        if let Some(mut performer) = self.test_performer.take() {
            performer.close();
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.close();
            pipeline.wait(Duration::from_secs(10));
        }
        if self.kind.is_android() {
            for app in self.cfg.cleanup_apps.clone() {
                if let Err(e) =
                    self.adb_execution(&format!("adb -s {} uninstall {app}", self.cfg.source))
                {
                    warn!(%app, error = %e, "cleanup uninstall failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_kind_from_config() {
        assert_eq!(PhoneKind::from_config("android").unwrap(), PhoneKind::Android);
        assert_eq!(
            PhoneKind::from_config("ANDROID_OLD").unwrap(),
            PhoneKind::AndroidOld
        );
        assert_eq!(PhoneKind::from_config("iphone").unwrap(), PhoneKind::Iphone);
        assert!(PhoneKind::from_config("blackberry").is_err());
    }

    #[test]
    fn old_android_does_not_share_the_threadtime_regex() {
        assert_ne!(
            PhoneKind::Android.default_line_regex(),
            PhoneKind::AndroidOld.default_line_regex()
        );
        assert_ne!(
            PhoneKind::AndroidOld.default_line_regex(),
            PhoneKind::Nexus4.default_line_regex()
        );
    }

    #[test]
    fn probe_rejects_unknown_and_unauthorized() {
        assert!(check_probe_output("SERIAL", "device\n", "").is_ok());
        assert!(check_probe_output("SERIAL", "unknown\n", "").is_err());
        assert!(check_probe_output("SERIAL", "unauthorized\n", "").is_err());
        assert!(check_probe_output("SERIAL", "device\n", "adb: no devices").is_err());
    }
}
