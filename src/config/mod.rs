//! Configuration module
//!
//! Handles loading and saving rtload configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::network::SessionConfig;
use crate::protocol::DEFAULT_VERSION_PARAM;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid target URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Real-time endpoint settings
    #[serde(default)]
    pub target: TargetConfig,

    /// Credential settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-session timing
    #[serde(default)]
    pub session: SessionSettings,

    /// Load shape and script
    #[serde(default)]
    pub load: LoadConfig,

    /// Report output
    #[serde(default)]
    pub report: ReportConfig,
}

/// Target endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Handshake endpoint
    #[serde(default = "default_url")]
    pub url: String,
    /// Query key carrying the protocol revision
    #[serde(default = "default_version_param")]
    pub version_param: String,
}

fn default_url() -> String {
    "http://localhost:3000/socket.io/".to_string()
}

fn default_version_param() -> String {
    DEFAULT_VERSION_PARAM.to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            version_param: default_version_param(),
        }
    }
}

/// Credential configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static bearer token shared by all clients
    pub token: Option<String>,
    /// Login endpoint returning `{"token": ...}`
    pub login_url: Option<String>,
    /// Login name; `{index}` is replaced by the client index
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Handshake + probe + CONNECT budget in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Default ack deadline in ms
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Outbound frame queue capacity
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_ack_timeout() -> u64 {
    5_000
}

fn default_outbound_queue() -> usize {
    256
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// One scripted action of a virtual client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Send an event, optionally waiting for its ACK
    Emit {
        event: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        ack: bool,
        /// Overrides `session.ack_timeout_ms`
        timeout_ms: Option<u64>,
    },
    /// Pause the client
    Sleep { ms: u64 },
    /// Wait until the named event arrives
    WaitFor {
        event: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },
}

fn default_wait_timeout() -> u64 {
    5_000
}

/// Load shape configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Number of virtual clients
    #[serde(default = "default_clients")]
    pub clients: usize,
    /// Window over which client starts are spread (ms)
    #[serde(default)]
    pub ramp_up_ms: u64,
    /// Handshakes allowed in flight at once
    #[serde(default = "default_max_concurrent_handshakes")]
    pub max_concurrent_handshakes: usize,
    /// Times each client runs the script
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Time each client stays connected after its script (ms)
    #[serde(default)]
    pub hold_ms: u64,
    /// Progress log interval (ms, 0 disables)
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
    /// Inbound events to count and make available to `wait_for`
    #[serde(default)]
    pub listen: Vec<String>,
    /// Actions each client performs once connected
    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

fn default_clients() -> usize {
    10
}

fn default_max_concurrent_handshakes() -> usize {
    100
}

fn default_iterations() -> usize {
    1
}

fn default_report_interval() -> u64 {
    5_000
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            ramp_up_ms: 0,
            max_concurrent_handshakes: default_max_concurrent_handshakes(),
            iterations: default_iterations(),
            hold_ms: 0,
            report_interval_ms: default_report_interval(),
            listen: Vec::new(),
            script: Vec::new(),
        }
    }
}

/// Report configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Write the JSON run report here
    pub output: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("rtload/config.toml")),
            Some(PathBuf::from("./rtload.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Build the per-session settings
    pub fn session_config(&self) -> ConfigResult<SessionConfig> {
        let url = Url::parse(&self.target.url).map_err(|source| ConfigError::InvalidUrl {
            url: self.target.url.clone(),
            source,
        })?;

        let mut config = SessionConfig::new(url)
            .with_connect_timeout(Duration::from_millis(self.session.connect_timeout_ms))
            .with_ack_timeout(Duration::from_millis(self.session.ack_timeout_ms));
        config.version_param = self.target.version_param.clone();
        config.outbound_queue = self.session.outbound_queue.max(1);
        Ok(config)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        auth: AuthConfig {
            login_url: Some("http://localhost:3000/api/auth/login".to_string()),
            username: Some("loadbot{index}".to_string()),
            password: Some("change-me".to_string()),
            ..Default::default()
        },
        load: LoadConfig {
            clients: 500,
            ramp_up_ms: 10_000,
            hold_ms: 30_000,
            listen: vec!["chat:new".to_string()],
            script: vec![
                ScriptStep::Emit {
                    event: "room:join".to_string(),
                    args: vec![serde_json::json!({"room": "lobby"})],
                    ack: true,
                    timeout_ms: None,
                },
                ScriptStep::Emit {
                    event: "chat:send".to_string(),
                    args: vec![serde_json::json!({"room": "lobby", "text": "hello"})],
                    ack: false,
                    timeout_ms: None,
                },
                ScriptStep::WaitFor {
                    event: "chat:new".to_string(),
                    timeout_ms: default_wait_timeout(),
                },
                ScriptStep::Sleep { ms: 1_000 },
            ],
            ..Default::default()
        },
        report: ReportConfig {
            output: Some(PathBuf::from("rtload-report.json")),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.connect_timeout_ms, 10_000);
        assert_eq!(config.session.ack_timeout_ms, 5_000);
        assert_eq!(config.target.version_param, "protocolVersion");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.load.clients = 42;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.load.clients, 42);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.load.clients, 500);
        assert_eq!(parsed.load.script.len(), 4);
    }

    #[test]
    fn test_script_steps_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[auth]
token = "abc"

[load]
clients = 3

[[load.script]]
type = "emit"
event = "move"
args = [{{ card = "QS" }}]
ack = true
timeout_ms = 250

[[load.script]]
type = "wait_for"
event = "trick:won"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.auth.token.as_deref(), Some("abc"));
        assert_eq!(
            config.load.script[0],
            ScriptStep::Emit {
                event: "move".to_string(),
                args: vec![serde_json::json!({"card": "QS"})],
                ack: true,
                timeout_ms: Some(250),
            }
        );
        assert_eq!(
            config.load.script[1],
            ScriptStep::WaitFor {
                event: "trick:won".to_string(),
                timeout_ms: 5_000,
            }
        );
    }

    #[test]
    fn test_session_config() {
        let mut config = Config::default();
        config.session.ack_timeout_ms = 750;
        let session = config.session_config().unwrap();
        assert_eq!(session.ack_timeout, Duration::from_millis(750));

        config.target.url = "not a url".to_string();
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/rtload.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
