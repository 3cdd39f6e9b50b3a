//! Validated configuration: typed section structs deserialized from YAML,
//! with defaults-file and patch merging plus dynamic options filled in after
//! validation.

use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, info};

use crate::error::{Result, VoltaError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub core: CoreSection,
    pub volta: VoltaSection,
    pub phone: PhoneSection,
    pub sync: SyncSection,
    pub uploader: UploaderSection,
    pub data_session: DataSessionSection,
    pub console: ConsoleSection,
}

/// Run-wide options. The dynamic fields are populated by the registry below
/// unless the config pins them explicitly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreSection {
    pub enabled: bool,
    pub pid: Option<u32>,
    pub cmdline: Option<String>,
    pub test_id: Option<String>,
    pub key_date: Option<String>,
    pub operator: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VoltaSection {
    pub enabled: bool,
    pub r#type: String,
    pub source: String,
    /// Overridden by the handshake for the binary box.
    pub sample_rate: Option<u32>,
    pub baud_rate: Option<u32>,
    pub chop_ratio: f64,
    /// Read timeout, seconds.
    pub grab_timeout: u64,
    pub slope: f64,
    pub offset: f64,
    pub precision: u32,
    pub power_voltage: f64,
    pub sample_swap: bool,
}

impl Default for VoltaSection {
    fn default() -> Self {
        VoltaSection {
            enabled: false,
            r#type: String::new(),
            source: String::new(),
            sample_rate: None,
            baud_rate: None,
            chop_ratio: 1.0,
            grab_timeout: 1,
            slope: 1.0,
            offset: 0.0,
            precision: 10,
            power_voltage: 4700.0,
            sample_swap: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhoneSection {
    pub enabled: bool,
    pub r#type: String,
    /// Platform device id (`adb devices` / `cfgutil list`).
    pub source: String,
    pub event_regexp: Option<String>,
    pub lightning: Option<String>,
    pub lightning_class: Option<String>,
    /// Path to Apple Configurator's cfgutil.
    pub util: Option<String>,
    pub test_apps: Vec<String>,
    pub test_class: Option<String>,
    pub test_package: Option<String>,
    pub test_runner: Option<String>,
    pub cleanup_apps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub enabled: bool,
    /// Seconds of data retained for cross-correlation.
    pub search_interval: u32,
}

impl Default for SyncSection {
    fn default() -> Self {
        SyncSection {
            enabled: false,
            search_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploaderSection {
    pub enabled: bool,
    pub address: String,
    pub task: String,
    pub create_job_url: String,
    pub update_job_url: String,
    pub component: String,
    pub name: Option<String>,
    pub dsc: Option<String>,
    pub device_id: Option<String>,
    pub device_model: Option<String>,
    pub device_os: Option<String>,
    pub app: Option<String>,
    pub ver: Option<String>,
    pub meta: Option<String>,
}

impl Default for UploaderSection {
    fn default() -> Self {
        UploaderSection {
            enabled: false,
            address: String::new(),
            task: String::new(),
            create_job_url: "/api/job/create".into(),
            update_job_url: "/api/job/update".into(),
            component: String::new(),
            name: None,
            dsc: None,
            device_id: None,
            device_model: None,
            device_os: None,
            app: None,
            ver: None,
            meta: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSessionSection {
    pub enabled: bool,
    pub artifacts_base_dir: String,
}

impl Default for DataSessionSection {
    fn default() -> Self {
        DataSessionSection {
            enabled: false,
            artifacts_base_dir: "./logs".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleSection {
    pub enabled: bool,
}

/// Dynamic options: auto-populated per run after schema validation, unless
/// pinned in the config. A small registry of name → setter keeps the list in
/// one place.
pub const DYNAMIC_OPTIONS: &[(&str, fn(&mut CoreSection))] = &[
    ("pid", |core| {
        core.pid.get_or_insert_with(std::process::id);
    }),
    ("cmdline", |core| {
        core.cmdline
            .get_or_insert_with(|| std::env::args().collect::<Vec<_>>().join(" "));
    }),
    ("test_id", |core| {
        core.test_id.get_or_insert_with(|| {
            format!(
                "{}_{}",
                chrono::Local::now().format("%Y-%m-%d"),
                uuid::Uuid::new_v4()
            )
        });
    }),
    ("key_date", |core| {
        core.key_date
            .get_or_insert_with(|| chrono::Local::now().format("%Y-%m-%d").to_string());
    }),
    ("operator", |core| {
        core.operator.get_or_insert_with(operator_name);
    }),
];

/// Account name of the effective user, `$USER` as fallback.
fn operator_name() -> String {
    unsafe {
        let passwd = libc::getpwuid(libc::geteuid());
        if !passwd.is_null() {
            let name = std::ffi::CStr::from_ptr((*passwd).pw_name);
            if let Ok(name) = name.to_str() {
                return name.to_string();
            }
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Recursive dict-wise merge: overlay mappings merge into base, everything
/// else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn load_yaml_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| VoltaError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_yaml::from_str(&text)
        .map_err(|e| VoltaError::Config(format!("malformed config {}: {e}", path.display())))
}

/// Loads and validates the configuration: optional defaults file, the main
/// config, then each `-p` patch merged on top, in that order.
pub fn load(defaults: Option<&Path>, config_path: &Path, patches: &[String]) -> Result<Config> {
    let mut merged = Value::Mapping(Default::default());
    if let Some(defaults_path) = defaults {
        match load_yaml_file(defaults_path) {
            Ok(value) => merge(&mut merged, value),
            Err(e) => info!(defaults = %defaults_path.display(), error = %e, "unable to load defaults"),
        }
    }
    merge(&mut merged, load_yaml_file(config_path)?);
    for patch in patches {
        let value: Value = serde_yaml::from_str(patch)
            .map_err(|e| VoltaError::Config(format!("malformed config patch: {e}")))?;
        if !value.is_mapping() {
            return Err(VoltaError::Config(format!(
                "config patch \"{patch}\" should be a dict"
            )));
        }
        merge(&mut merged, value);
    }

    let mut config: Config =
        serde_yaml::from_value(merged).map_err(|e| VoltaError::Config(e.to_string()))?;
    for (name, setter) in DYNAMIC_OPTIONS {
        setter(&mut config.core);
        debug!(option = name, "dynamic option applied");
    }
    validate(&config)?;
    Ok(config)
}

/// Mandatory-option checks for the enabled sections.
fn validate(config: &Config) -> Result<()> {
    if config.volta.enabled {
        if config.volta.r#type.is_empty() {
            return Err(VoltaError::Config(
                "mandatory option volta.type not specified".into(),
            ));
        }
        if config.volta.source.is_empty() {
            return Err(VoltaError::Config(
                "mandatory option volta.source not specified".into(),
            ));
        }
    }
    if config.phone.enabled {
        if config.phone.r#type.is_empty() {
            return Err(VoltaError::Config(
                "mandatory option phone.type not specified".into(),
            ));
        }
        if config.phone.source.is_empty() {
            return Err(VoltaError::Config(
                "mandatory option phone.source not specified".into(),
            ));
        }
    }
    if config.uploader.enabled && config.uploader.address.is_empty() {
        return Err(VoltaError::Config(
            "mandatory option uploader.address not specified".into(),
        ));
    }
    if config.sync.enabled && config.sync.search_interval == 0 {
        return Err(VoltaError::Config(
            "sync.search_interval must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_sections_with_defaults() {
        let file = write_config(
            "volta:\n  enabled: true\n  type: 500hz\n  source: /tmp/data.txt\n",
        );
        let config = load(None, file.path(), &[]).unwrap();
        assert!(config.volta.enabled);
        assert_eq!(config.volta.chop_ratio, 1.0);
        assert_eq!(config.volta.power_voltage, 4700.0);
        assert!(!config.phone.enabled);
    }

    #[test]
    fn dynamic_options_are_populated() {
        let file = write_config("core:\n  enabled: true\n");
        let config = load(None, file.path(), &[]).unwrap();
        assert!(config.core.pid.is_some());
        let test_id = config.core.test_id.unwrap();
        let key_date = config.core.key_date.unwrap();
        // date-prefixed uuid
        assert!(test_id.starts_with(&key_date));
        assert!(config.core.operator.is_some());
    }

    #[test]
    fn explicit_test_id_wins_over_dynamic() {
        let file = write_config("core:\n  test_id: my-run\n");
        let config = load(None, file.path(), &[]).unwrap();
        assert_eq!(config.core.test_id.as_deref(), Some("my-run"));
    }

    #[test]
    fn patches_merge_over_the_config() {
        let file = write_config(
            "volta:\n  enabled: true\n  type: 500hz\n  source: /tmp/a\n  slope: 2.0\n",
        );
        let patches = vec!["volta: {source: /tmp/b}".to_string()];
        let config = load(None, file.path(), &patches).unwrap();
        assert_eq!(config.volta.source, "/tmp/b");
        // untouched keys survive the merge
        assert_eq!(config.volta.slope, 2.0);
    }

    #[test]
    fn non_dict_patch_is_rejected() {
        let file = write_config("core: {}\n");
        let patches = vec!["just-a-string".to_string()];
        assert!(matches!(
            load(None, file.path(), &patches),
            Err(VoltaError::Config(_))
        ));
    }

    #[test]
    fn unknown_keys_are_a_schema_error() {
        let file = write_config("volta:\n  enabled: true\n  type: 500hz\n  source: x\n  warp: 9\n");
        assert!(matches!(
            load(None, file.path(), &[]),
            Err(VoltaError::Config(_))
        ));
    }

    #[test]
    fn missing_mandatory_option_fails() {
        let file = write_config("volta:\n  enabled: true\n  type: 500hz\n");
        assert!(matches!(
            load(None, file.path(), &[]),
            Err(VoltaError::Config(_))
        ));
    }

    #[test]
    fn defaults_file_sits_under_the_config() {
        let defaults = write_config("uploader:\n  task: DEFAULT-1\n  address: http://backend\n");
        let file = write_config("uploader:\n  enabled: true\n  task: REAL-7\n");
        let config = load(Some(defaults.path()), file.path(), &[]).unwrap();
        assert_eq!(config.uploader.task, "REAL-7");
        assert_eq!(config.uploader.address, "http://backend");
    }

    #[test]
    fn missing_defaults_file_is_tolerated() {
        let file = write_config("core: {}\n");
        let config = load(Some(Path::new("/nonexistent/volta.yaml")), file.path(), &[]);
        assert!(config.is_ok());
    }
}
