//! Observer configuration: defaults, YAML file loading, validation.
//!
//! Precedence is defaults < config file < command-line flags; the flag
//! layer is applied in `main`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tool version surfaced by `--version` and `meta.session_start`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Connection
    pub chrome_port: u16,
    pub auto_launch: bool,

    // Output
    pub output_dir: PathBuf,
    #[serde(with = "duration_text")]
    pub flush_interval: Duration,
    pub buffer_size: usize,

    // Privacy & body capture
    pub redact: bool,
    pub capture_bodies: bool,
    pub body_size_limit_kb: u64,
    pub body_content_types: Vec<String>,
    pub redact_headers: Vec<String>,
    pub redact_body_fields: Vec<String>,

    // Event filtering
    pub enable_network: bool,
    pub enable_console: bool,
    pub enable_errors: bool,
    pub enable_page: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chrome_port: 9222,
            auto_launch: false,

            output_dir: PathBuf::from("./logs"),
            flush_interval: Duration::from_millis(100),
            buffer_size: 8 * 1024,

            redact: true,
            capture_bodies: false,
            body_size_limit_kb: 10,
            body_content_types: vec!["text/*".to_string(), "application/json".to_string()],
            redact_headers: Vec::new(),
            redact_body_fields: Vec::new(),

            enable_network: true,
            enable_console: true,
            enable_errors: true,
            enable_page: true,
        }
    }
}

impl Config {
    /// Loads a YAML config file. File values override the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chrome_port == 0 {
            bail!("chrome_port is required");
        }
        if self.output_dir.as_os_str().is_empty() {
            bail!("output_dir is required");
        }
        if self.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }
        if self.body_size_limit_kb < 1 {
            bail!("body_size_limit_kb must be at least 1");
        }
        Ok(())
    }
}

/// Durations rendered as humantime text ("100ms", "2s") in YAML.
mod duration_text {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.chrome_port, 9222);
        assert!(!config.auto_launch);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.buffer_size, 8 * 1024);
        assert!(config.redact);
        assert!(!config.capture_bodies);
        assert_eq!(config.body_size_limit_kb, 10);
        assert!(config.enable_network && config.enable_console);
        assert!(config.enable_errors && config.enable_page);
    }

    #[test]
    fn yaml_overrides_defaults_partially() {
        let yaml = "chrome_port: 9333\nflush_interval: 250ms\nenable_console: false\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chrome_port, 9333);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert!(!config.enable_console);
        // Untouched keys keep their defaults.
        assert!(config.redact);
        assert_eq!(config.output_dir, PathBuf::from("./logs"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.buffer_size = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.body_size_limit_kb = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output_dir = PathBuf::new();
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn durations_round_trip_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.flush_interval, config.flush_interval);
    }
}
