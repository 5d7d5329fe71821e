//! # flowpack-config
//!
//! Configuration surface for both binaries (`flowpackd`, `flowappendd`).
//!
//! Loads from:
//! 1. built-in defaults
//! 2. a TOML file named by `--config` / `FLOWPACK_CONFIG` (optional)
//! 3. environment variables (highest priority)

pub mod logging;
pub mod path;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The four input modes named in the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputMode {
    Stream,
    PduFile,
    FcFiles,
    Respool,
}

impl Default for InputMode {
    fn default() -> Self {
        InputMode::Stream
    }
}

/// The three output modes named in the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    LocalStorage,
    IncrementalFiles,
    Sending,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::LocalStorage
    }
}

/// Byte-order configuration option; maps directly onto
/// `flowpack_wire::ByteOrder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrderOpt {
    Native,
    Little,
    Big,
    AsIs,
}

impl Default for ByteOrderOpt {
    fn default() -> Self {
        ByteOrderOpt::Native
    }
}

pub const DEFAULT_FILE_CACHE_SIZE: usize = 128;
pub const MIN_FILE_CACHE_SIZE: usize = 4;
pub const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_APPENDER_THREADS: usize = 1;

/// Appender-specific options (§6 "Appender-specific additional options").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppenderConfig {
    pub threads: usize,
    pub reject_hours_past: Option<u32>,
    pub reject_hours_future: Option<u32>,
    pub hour_file_command: Option<String>,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_APPENDER_THREADS,
            reject_hours_past: None,
            reject_hours_future: None,
            hour_file_command: None,
        }
    }
}

/// Full packer/appender configuration (§6 "Configuration (abstractly)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input_mode: InputMode,
    pub output_mode: OutputMode,
    pub root_directory: Option<PathBuf>,
    pub incremental_directory: Option<PathBuf>,
    /// Directory polled for native-binary input in respool input mode.
    pub respool_directory: Option<PathBuf>,
    /// Directory polled for pre-tagged, probe-name-header files in
    /// fcfiles input mode (spec.md "poll-dir-fcfiles").
    pub fcfiles_directory: Option<PathBuf>,
    pub sender_directory: Option<PathBuf>,
    pub error_directory: Option<PathBuf>,
    pub archive_directory: Option<PathBuf>,
    pub flat_archive: bool,
    pub post_archive_command: Option<String>,
    pub sensor_configuration: Option<PathBuf>,
    /// Name of the registered packing-logic strategy (§4.4 / §9).
    pub packing_logic: String,
    pub file_cache_size: usize,
    pub flush_timeout_secs: u64,
    pub polling_interval_secs: u64,
    pub byte_order: ByteOrderOpt,
    pub no_file_locking: bool,
    pub pack_interfaces: bool,
    pub netflow_file: Option<PathBuf>,
    pub sensor_name: Option<String>,
    pub appender: AppenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_mode: InputMode::default(),
            output_mode: OutputMode::default(),
            root_directory: None,
            incremental_directory: None,
            respool_directory: None,
            fcfiles_directory: None,
            sender_directory: None,
            error_directory: None,
            archive_directory: None,
            flat_archive: false,
            post_archive_command: None,
            sensor_configuration: None,
            packing_logic: "respool".to_string(),
            file_cache_size: DEFAULT_FILE_CACHE_SIZE,
            flush_timeout_secs: DEFAULT_FLUSH_TIMEOUT_SECS,
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            byte_order: ByteOrderOpt::default(),
            no_file_locking: false,
            pack_interfaces: false,
            netflow_file: None,
            sensor_name: None,
            appender: AppenderConfig::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file (falling back to defaults if
    /// `path` is `None` or absent), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Toml {
                    path: p.to_path_buf(),
                    source,
                })?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("FLOWPACK_ROOT_DIRECTORY") {
            self.root_directory = Some(PathBuf::from(root));
        }
        if let Ok(dir) = std::env::var("FLOWPACK_INCREMENTAL_DIRECTORY") {
            self.incremental_directory = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = std::env::var("FLOWPACK_ERROR_DIRECTORY") {
            self.error_directory = Some(PathBuf::from(dir));
        }
        if let Ok(size) = std::env::var("FLOWPACK_FILE_CACHE_SIZE") {
            if let Ok(n) = size.parse() {
                self.file_cache_size = n;
            }
        }
        if let Ok(secs) = std::env::var("FLOWPACK_FLUSH_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.flush_timeout_secs = n;
            }
        }
        if std::env::var("FLOWPACK_NO_FILE_LOCKING").is_ok() {
            self.no_file_locking = true;
        }
        if let Ok(threads) = std::env::var("FLOWPACK_APPENDER_THREADS") {
            if let Ok(n) = threads.parse() {
                self.appender.threads = n;
            }
        }
    }

    /// Cross-field validation, matching the required-option combinations
    /// named in §6. Used by both `flowpackd check-config` and startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_cache_size < MIN_FILE_CACHE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "file-cache-size must be >= {MIN_FILE_CACHE_SIZE}, got {}",
                self.file_cache_size
            )));
        }
        if self.appender.threads < 1 {
            return Err(ConfigError::Invalid(
                "appender threads must be >= 1".to_string(),
            ));
        }

        match self.output_mode {
            OutputMode::LocalStorage if self.root_directory.is_none() => {
                return Err(ConfigError::Invalid(
                    "root-directory is required in local-storage output mode".to_string(),
                ));
            }
            OutputMode::IncrementalFiles if self.incremental_directory.is_none() => {
                return Err(ConfigError::Invalid(
                    "incremental-directory is required in incremental-files output mode"
                        .to_string(),
                ));
            }
            // Sending mode stages its placeholder+working pairs the same
            // way incremental-files mode does; sender-directory is only
            // the move destination the flush timer resolves them to.
            OutputMode::Sending if self.sender_directory.is_none() => {
                return Err(ConfigError::Invalid(
                    "sender-directory is required in sending output mode".to_string(),
                ));
            }
            OutputMode::Sending if self.incremental_directory.is_none() => {
                return Err(ConfigError::Invalid(
                    "incremental-directory is required in sending output mode".to_string(),
                ));
            }
            _ => {}
        }

        if self.input_mode != InputMode::Respool && self.sensor_configuration.is_none() {
            return Err(ConfigError::Invalid(
                "sensor-configuration is required except in respool input mode".to_string(),
            ));
        }

        if self.input_mode == InputMode::Respool && self.respool_directory.is_none() {
            return Err(ConfigError::Invalid(
                "respool-directory is required in respool input mode".to_string(),
            ));
        }

        if self.input_mode == InputMode::PduFile && self.netflow_file.is_none() {
            return Err(ConfigError::Invalid(
                "netflow-file is required in pdufile input mode".to_string(),
            ));
        }

        if self.input_mode == InputMode::FcFiles && self.fcfiles_directory.is_none() {
            return Err(ConfigError::Invalid(
                "fcfiles-directory is required in fcfiles input mode".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn defaults_have_expected_values() {
        let config = Config::default();
        assert_eq!(config.file_cache_size, DEFAULT_FILE_CACHE_SIZE);
        assert_eq!(config.flush_timeout_secs, DEFAULT_FLUSH_TIMEOUT_SECS);
        assert_eq!(config.appender.threads, DEFAULT_APPENDER_THREADS);
        assert_eq!(config.output_mode, OutputMode::LocalStorage);
    }

    #[test]
    fn load_without_path_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.file_cache_size, DEFAULT_FILE_CACHE_SIZE);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowpack.toml");
        std::fs::write(
            &path,
            r#"
input-mode = "respool"
output-mode = "sending"
sender-directory = "/tmp/sender"
file-cache-size = 64
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.input_mode, InputMode::Respool);
        assert_eq!(config.output_mode, OutputMode::Sending);
        assert_eq!(config.file_cache_size, 64);
    }

    #[test]
    fn env_override_wins_over_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("FLOWPACK_FILE_CACHE_SIZE", "200");
        let config = Config::load(None).unwrap();
        std::env::remove_var("FLOWPACK_FILE_CACHE_SIZE");
        assert_eq!(config.file_cache_size, 200);
    }

    #[test]
    fn validate_rejects_missing_root_directory() {
        let config = Config {
            output_mode: OutputMode::LocalStorage,
            input_mode: InputMode::Respool,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_respool_without_sensor_configuration() {
        let config = Config {
            input_mode: InputMode::Respool,
            output_mode: OutputMode::LocalStorage,
            root_directory: Some(PathBuf::from("/tmp/root")),
            respool_directory: Some(PathBuf::from("/tmp/respool")),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_respool_without_respool_directory() {
        let config = Config {
            input_mode: InputMode::Respool,
            output_mode: OutputMode::LocalStorage,
            root_directory: Some(PathBuf::from("/tmp/root")),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_fcfiles_without_fcfiles_directory() {
        let config = Config {
            input_mode: InputMode::FcFiles,
            output_mode: OutputMode::LocalStorage,
            root_directory: Some(PathBuf::from("/tmp/root")),
            sensor_configuration: Some(PathBuf::from("/tmp/sensors.toml")),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_sending_without_sender_directory() {
        let config = Config {
            input_mode: InputMode::Respool,
            output_mode: OutputMode::Sending,
            respool_directory: Some(PathBuf::from("/tmp/respool")),
            incremental_directory: Some(PathBuf::from("/tmp/incr")),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_sending_without_incremental_directory() {
        let config = Config {
            input_mode: InputMode::Respool,
            output_mode: OutputMode::Sending,
            respool_directory: Some(PathBuf::from("/tmp/respool")),
            sender_directory: Some(PathBuf::from("/tmp/sender")),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_sending_with_both_directories() {
        let config = Config {
            input_mode: InputMode::Respool,
            output_mode: OutputMode::Sending,
            respool_directory: Some(PathBuf::from("/tmp/respool")),
            incremental_directory: Some(PathBuf::from("/tmp/incr")),
            sender_directory: Some(PathBuf::from("/tmp/sender")),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_too_small_cache_size() {
        let config = Config {
            file_cache_size: 1,
            input_mode: InputMode::Respool,
            root_directory: Some(PathBuf::from("/tmp/root")),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
