//! Configuration loading for the AS terminal driver

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{KROSET_PORT, PC_THREADS};
use crate::session::SessionOptions;
use crate::upload::{SyntaxPolicy, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::{KHIError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub robot: RobotConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub host: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub connect_timeout: Option<f64>,
    pub command_timeout: Option<f64>,
    pub execution_timeout: Option<f64>,
    pub operation_timeout: Option<f64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UploadConfig {
    pub batch_size: Option<usize>,
    pub syntax_errors: Option<SyntaxPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PollingConfig {
    pub interval_ms: Option<u64>,
    pub threads: Option<Vec<u8>>,
}

impl Config {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            KHIError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a host with every other setting defaulted
    pub fn for_host(host: &str, port: u16) -> Self {
        Self {
            robot: RobotConfig {
                host: host.to_string(),
                port: Some(port),
            },
            connection: ConnectionConfig::default(),
            upload: UploadConfig::default(),
            polling: PollingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(KHIError::Config("robot.host must not be empty".to_string()));
        }
        if self.robot.port() == 0 {
            return Err(KHIError::Config("robot.port must not be 0".to_string()));
        }

        let timeouts = [
            ("connection.connect_timeout", self.connection.connect_timeout),
            ("connection.command_timeout", self.connection.command_timeout),
            ("connection.execution_timeout", self.connection.execution_timeout),
            ("connection.operation_timeout", self.connection.operation_timeout),
            ("connection.retry_delay", self.connection.retry_delay),
        ];
        for (name, value) in timeouts {
            if let Some(seconds) = value {
                if !seconds.is_finite() || seconds <= 0.0 {
                    return Err(KHIError::Config(format!(
                        "{} must be a positive number of seconds, got {}",
                        name, seconds
                    )));
                }
            }
        }

        let batch_size = self.upload.batch_size();
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(KHIError::Config(format!(
                "upload.batch_size must be within 1..={}, got {}",
                MAX_BATCH_SIZE, batch_size
            )));
        }

        if self.polling.interval_ms() == 0 {
            return Err(KHIError::Config("polling.interval_ms must not be 0".to_string()));
        }
        if let Some(thread) = self
            .polling
            .threads()
            .into_iter()
            .find(|t| !(1..=PC_THREADS).contains(t))
        {
            return Err(KHIError::InvalidThread(thread));
        }
        Ok(())
    }

    /// Protocol settings for a new session
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: self.connection.connect_timeout(),
            command_timeout: self.connection.command_timeout(),
            execution_timeout: self.connection.execution_timeout(),
            batch_size: self.upload.batch_size(),
            syntax_policy: self.upload.syntax_policy(),
        }
    }
}

impl RobotConfig {
    /// Port with K-ROSET default
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(KROSET_PORT)
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout.unwrap_or(10.0))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout.unwrap_or(1.0))
    }

    /// `None` waits for a blocking run indefinitely
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout.map(Duration::from_secs_f64)
    }

    /// Deadline for one controller-level operation, blocking RCP runs excluded
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout.map(Duration::from_secs_f64)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(3)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.unwrap_or(1.0))
    }
}

impl UploadConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn syntax_policy(&self) -> SyntaxPolicy {
        self.syntax_errors.unwrap_or(SyntaxPolicy::Lenient)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms())
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.unwrap_or(500)
    }

    pub fn threads(&self) -> Vec<u8> {
        self.threads
            .clone()
            .unwrap_or_else(|| (1..=PC_THREADS).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
robot:
  host: 192.168.0.2
  port: 23
connection:
  connect_timeout: 5.0
  command_timeout: 0.5
  execution_timeout: 120
  operation_timeout: 30
  retry_attempts: 5
  retry_delay: 2.0
upload:
  batch_size: 2000
  syntax_errors: strict
polling:
  interval_ms: 250
  threads: [1, 3]
"#;

    #[test]
    fn test_full_config() {
        let config = Config::load_from_str(FULL).unwrap();
        assert_eq!(config.robot.port(), 23);
        assert_eq!(config.connection.retry_attempts(), 5);
        assert_eq!(config.connection.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.connection.operation_timeout(), Some(Duration::from_secs(30)));

        let options = config.session_options();
        assert_eq!(options.command_timeout, Duration::from_millis(500));
        assert_eq!(options.execution_timeout, Some(Duration::from_secs(120)));
        assert_eq!(options.batch_size, 2000);
        assert_eq!(options.syntax_policy, SyntaxPolicy::Strict);
        assert_eq!(config.polling.threads(), vec![1, 3]);
    }

    #[test]
    fn test_defaults_for_minimal_config() {
        let config = Config::load_from_str("robot:\n  host: localhost\n").unwrap();
        assert_eq!(config.robot.port(), KROSET_PORT);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection.command_timeout(), Duration::from_secs(1));
        assert_eq!(config.connection.execution_timeout(), None);
        assert_eq!(config.upload.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(config.upload.syntax_policy(), SyntaxPolicy::Lenient);
        assert_eq!(config.polling.interval(), Duration::from_millis(500));
        assert_eq!(config.polling.threads(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            "robot:\n  host: ''\n",
            "robot:\n  host: a\n  port: 0\n",
            "robot:\n  host: a\nupload:\n  batch_size: 3001\n",
            "robot:\n  host: a\nupload:\n  batch_size: 0\n",
            "robot:\n  host: a\nconnection:\n  command_timeout: 0\n",
            "robot:\n  host: a\npolling:\n  threads: [6]\n",
        ];
        for yaml in bad {
            assert!(Config::load_from_str(yaml).is_err(), "accepted: {}", yaml);
        }
    }

    #[test]
    fn test_unknown_policy_is_yaml_error() {
        let yaml = "robot:\n  host: a\nupload:\n  syntax_errors: maybe\n";
        assert!(matches!(Config::load_from_str(yaml), Err(KHIError::Yaml(_))));
    }

    #[test]
    fn test_default_config_file_parses() {
        let config = Config::load_from_str(include_str!("../config/default_config.yaml")).unwrap();
        assert_eq!(config.robot.port(), KROSET_PORT);
    }
}
