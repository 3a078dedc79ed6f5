//! Node configuration.
//!
//! Read from a TOML file; every section and key is optional and falls back
//! to the device defaults. See `node.example.toml` at the repository root.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::PublishPolicy;
use crate::broker::SessionOptions;
use crate::classify::BackendOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Publish captures to the broker on request.
    #[default]
    Capture,
    /// Periodically upload a capture to the classification backend.
    Classify,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Capture => "capture",
            Mode::Classify => "classify",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub backend: BackendSection,
    pub broker: BrokerSection,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    pub mode: Mode,
    /// Which side of the object this camera sees, e.g. `top` or `front`.
    pub side: String,
    pub thing_name: String,
    pub tick_interval_ms: u64,
    pub classify_interval_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            mode: Mode::Capture,
            side: "top".into(),
            thing_name: "capture-node-top".into(),
            tick_interval_ms: 100,
            classify_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub endpoint: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 80,
            timeout_ms: 5_000,
            endpoint: "/image-classification".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub request_topic: String,
    pub complete_topic: String,
    pub connect_retry_ms: u64,
    pub op_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 300,
            request_topic: "capture/request".into(),
            complete_topic: "capture/complete".into(),
            connect_retry_ms: 1_000,
            op_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub max_attempts: u32,
    pub command: String,
    pub args: Vec<String>,
    pub pool_size: usize,
    /// Longest a single capture command may run before it is killed.
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            command: "libcamera-jpeg".into(),
            args: vec!["-n".into(), "-t".into(), "1".into(), "-o".into(), "-".into()],
            pool_size: 2,
            timeout_ms: 5_000,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let side = self.node.side.trim();
        if side.is_empty() {
            problems.push("node.side is required".to_string());
        } else if side.contains(['/', '+', '#']) {
            problems.push(format!("node.side `{side}` must not contain '/', '+' or '#'"));
        }
        if self.node.tick_interval_ms == 0 {
            problems.push("node.tick_interval_ms must be at least 1".to_string());
        }

        match self.node.mode {
            Mode::Capture => {
                if self.broker.host.trim().is_empty() {
                    problems.push("broker.host is required in capture mode".to_string());
                }
                if self.broker.request_topic.trim().is_empty() {
                    problems.push("broker.request_topic is required".to_string());
                }
                if self.broker.complete_topic.trim().is_empty() {
                    problems.push("broker.complete_topic is required".to_string());
                }
                if self.broker.op_timeout_ms == 0 {
                    problems.push("broker.op_timeout_ms must be at least 1".to_string());
                }
            }
            Mode::Classify => {
                if self.backend.host.trim().is_empty() {
                    problems.push("backend.host is required in classify mode".to_string());
                }
                if !self.backend.endpoint.trim().starts_with('/') {
                    problems.push("backend.endpoint must start with '/'".to_string());
                }
                if self.backend.timeout_ms == 0 {
                    problems.push("backend.timeout_ms must be at least 1".to_string());
                }
                if self.node.classify_interval_ms == 0 {
                    problems.push("node.classify_interval_ms must be at least 1".to_string());
                }
            }
        }

        if self.capture.max_attempts == 0 {
            problems.push("capture.max_attempts must be at least 1".to_string());
        }
        if self.capture.command.trim().is_empty() {
            problems.push("capture.command is required".to_string());
        }
        if self.capture.pool_size == 0 {
            problems.push("capture.pool_size must be at least 1".to_string());
        }
        if self.capture.timeout_ms == 0 {
            problems.push("capture.timeout_ms must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.node.tick_interval_ms)
    }

    pub fn classify_interval(&self) -> Duration {
        Duration::from_millis(self.node.classify_interval_ms)
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            host: self.backend.host.trim().to_string(),
            port: self.backend.port,
            timeout: Duration::from_millis(self.backend.timeout_ms),
            endpoint: self.backend.endpoint.trim().to_string(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            host: self.broker.host.trim().to_string(),
            port: self.broker.port,
            client_id: self.node.thing_name.clone(),
            username: non_empty(&self.broker.username),
            password: non_empty(&self.broker.password),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            request_topic: self.broker.request_topic.clone(),
            connect_retry: Duration::from_millis(self.broker.connect_retry_ms),
            op_timeout: Duration::from_millis(self.broker.op_timeout_ms),
        }
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            max_attempts: self.capture.max_attempts,
            complete_topic: self.broker.complete_topic.clone(),
            side: self.node.side.trim().to_string(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_yields_device_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();

        assert_eq!(config.node.mode, Mode::Capture);
        assert_eq!(config.node.side, "top");
        assert_eq!(config.backend.port, 80);
        assert_eq!(config.backend.timeout_ms, 5_000);
        assert_eq!(config.backend.endpoint, "/image-classification");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keep_alive_secs, 300);
        assert_eq!(config.broker.request_topic, "capture/request");
        assert_eq!(config.broker.complete_topic, "capture/complete");
        assert_eq!(config.capture.max_attempts, 5);
        assert_eq!(config.capture.pool_size, 2);
        assert_eq!(config.capture.timeout_ms, 5_000);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[node]
mode = "classify"
side = "front"

[backend]
host = "backend.local"
port = 8080

[capture]
max_attempts = 3
"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node.mode, Mode::Classify);
        assert_eq!(config.publish_policy().side, "front");
        assert_eq!(config.publish_policy().max_attempts, 3);
        assert_eq!(config.backend_options().port, 8080);
    }

    #[test]
    fn capture_mode_requires_broker_host() {
        let config = NodeConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broker.host is required"));
    }

    #[test]
    fn validation_reports_every_problem() {
        let config = NodeConfig::from_toml_str(
            r#"
[node]
mode = "classify"
side = "a/b"

[backend]
endpoint = "image-classification"

[capture]
max_attempts = 0
"#,
        )
        .unwrap();

        match config.validate() {
            Err(ConfigError::Invalid(problems)) => {
                // side, backend.host, endpoint, max_attempts
                assert_eq!(problems.len(), 4, "{problems:?}");
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn empty_credentials_are_omitted() {
        let config = NodeConfig::from_toml_str(
            r#"
[broker]
host = "mqtt.local"
username = ""
password = "secret"
"#,
        )
        .unwrap();

        let options = config.session_options();
        assert_eq!(options.username, None);
        assert_eq!(options.password.as_deref(), Some("secret"));
    }

    #[test]
    fn example_config_is_valid() {
        let config = NodeConfig::from_toml_str(include_str!("../node.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("[broker]\nhots = \"typo\"\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
