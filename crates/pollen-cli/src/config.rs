//! Configuration Vault – reads/writes `~/.pollen/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pollen_hal::ChannelConfig;
use pollen_perception::ProcessClassifierConfig;
use pollen_runtime::PipelineConfig;

/// Persisted service configuration stored in `~/.pollen/config.toml`.
///
/// Missing keys fall back to their defaults, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP port for the pollination API.
    pub api_port: u16,

    /// Serial port to try first; discovery runs when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,

    pub baud_rate: u32,
    pub command_timeout_ms: u64,

    /// How long to wait for the controller's ready banner after opening.
    pub ready_grace_ms: u64,

    /// Connect to the controller at startup instead of waiting for
    /// `POST /api/pollination/connect`.
    pub auto_connect: bool,

    /// Drive the in-process simulated controller instead of real ports.
    pub simulate: bool,

    pub classifier_script: PathBuf,
    pub classifier_model: PathBuf,

    /// Interpreter for the classifier script; resolved from the
    /// environment when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_interpreter: Option<String>,

    pub cooldown_ms: u64,
    pub frame_range_cm: f64,
    pub detection_range_cm: f64,
}

impl Default for Config {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            api_port: pollen_cockpit::DEFAULT_PORT,
            serial_port: None,
            baud_rate: pollen_hal::transport::DEFAULT_BAUD_RATE,
            command_timeout_ms: pollen_hal::channel::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            ready_grace_ms: pollen_hal::channel::DEFAULT_READY_GRACE.as_millis() as u64,
            auto_connect: false,
            simulate: false,
            classifier_script: PathBuf::from("classifier/flower_classifier_service.py"),
            classifier_model: PathBuf::from("classifier/flower_classifier_model.h5"),
            classifier_interpreter: None,
            cooldown_ms: pipeline.cooldown.as_millis() as u64,
            frame_range_cm: pipeline.frame_range_cm,
            detection_range_cm: pipeline.detection_range_cm,
        }
    }
}

impl Config {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            baud_rate: self.baud_rate,
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            ready_grace: Duration::from_millis(self.ready_grace_ms),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            frame_range_cm: self.frame_range_cm,
            detection_range_cm: self.detection_range_cm,
            cooldown: Duration::from_millis(self.cooldown_ms),
            ..PipelineConfig::default()
        }
    }

    pub fn classifier_config(&self) -> ProcessClassifierConfig {
        let config = ProcessClassifierConfig::new(self.classifier_script.clone(), self.classifier_model.clone());
        match &self.classifier_interpreter {
            Some(interpreter) => config.with_interpreter(interpreter.clone()),
            None => config,
        }
    }
}

/// Return the path to `~/.pollen/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pollen").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `POLLEN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `POLLEN_API_PORT` | `api_port` |
/// | `POLLEN_SERIAL_PORT` | `serial_port` |
/// | `POLLEN_SIMULATE` | `simulate` |
/// | `POLLEN_CLASSIFIER_SCRIPT` | `classifier_script` |
/// | `POLLEN_CLASSIFIER_MODEL` | `classifier_model` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("POLLEN_API_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.api_port = port;
    }
    if let Some(v) = lookup("POLLEN_SERIAL_PORT") {
        cfg.serial_port = Some(v).filter(|p| !p.is_empty());
    }
    if let Some(v) = lookup("POLLEN_SIMULATE")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.simulate = flag;
    }
    if let Some(v) = lookup("POLLEN_CLASSIFIER_SCRIPT") {
        cfg.classifier_script = PathBuf::from(v);
    }
    if let Some(v) = lookup("POLLEN_CLASSIFIER_MODEL") {
        cfg.classifier_model = PathBuf::from(v);
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.pollen/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
