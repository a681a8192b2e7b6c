//! Runner configuration

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wsstory_common::{Connector, TcpConnector, WsConnector};

use crate::error::{RunnerError, RunnerResult};
use crate::session::SessionOptions;

/// Overrides `backend.address`
pub const ENV_BACKEND_ADDR: &str = "WSSTORY_BACKEND_ADDR";

/// Overrides `backend.url`
pub const ENV_BACKEND_URL: &str = "WSSTORY_BACKEND_URL";

/// Overrides `session.response_timeout_ms`
pub const ENV_RESPONSE_TIMEOUT_MS: &str = "WSSTORY_RESPONSE_TIMEOUT_MS";

/// Runner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backend connection
    pub backend: BackendConfig,

    /// Session behaviour
    pub session: SessionConfig,

    /// Fixtures installed into the namespace before every scenario
    pub fixtures: FixtureConfig,
}

/// Framing used to reach the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One JSON message per WebSocket text frame
    #[default]
    WebSocket,
    /// Newline-delimited JSON over TCP
    Lines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub transport: TransportKind,

    /// WebSocket endpoint, used with `transport = "websocket"`
    pub url: String,

    /// `host:port` of the backend, used with `transport = "lines"`
    pub address: String,

    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            url: "ws://127.0.0.1:8000/ws1.ws".to_string(),
            address: "127.0.0.1:8000".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded wait for every response
    pub response_timeout_ms: u64,

    /// Read the backend's greeting after connecting
    pub expect_greeting: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            expect_greeting: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Connection options per database kind (`mysql`, `sqlite`, ...)
    pub database_connections: BTreeMap<String, ConnectionFixture>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        let mut database_connections = BTreeMap::new();
        database_connections.insert(
            "mysql".to_string(),
            ConnectionFixture {
                scheme: "mysql".to_string(),
                user: "root".to_string(),
                host: "localhost".to_string(),
                port: 3306,
                ..ConnectionFixture::default()
            },
        );
        database_connections.insert(
            "sqlite".to_string(),
            ConnectionFixture {
                scheme: "sqlite".to_string(),
                ..ConnectionFixture::default()
            },
        );
        Self { database_connections }
    }
}

/// Options for one kind of database connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionFixture {
    pub scheme: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    /// Anything else, passed through untouched (e.g. `db_file`)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionFixture {
    /// `scheme://user@host:port`
    pub fn uri(&self) -> String {
        format!("{}://{}@{}:{}", self.scheme, self.user, self.host, self.port)
    }
}

impl RunnerConfig {
    pub fn from_toml_str(content: &str) -> RunnerResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// File if present, defaults otherwise; environment overrides on top
    pub fn load(path: Option<&Path>) -> RunnerResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> RunnerResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| RunnerError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn apply_env(&mut self) -> RunnerResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> RunnerResult<()> {
        if let Some(address) = lookup(ENV_BACKEND_ADDR) {
            debug!("Backend address overridden: {}", address);
            self.backend.address = address;
        }
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            debug!("Backend url overridden: {}", url);
            self.backend.url = url;
        }
        if let Some(timeout) = lookup(ENV_RESPONSE_TIMEOUT_MS) {
            self.session.response_timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|_| RunnerError::Config(format!("{} must be milliseconds, got '{}'", ENV_RESPONSE_TIMEOUT_MS, timeout)))?;
        }
        self.validate()
    }

    fn validate(&self) -> RunnerResult<()> {
        match self.backend.transport {
            TransportKind::WebSocket => {
                if !(self.backend.url.starts_with("ws://") || self.backend.url.starts_with("wss://")) {
                    return Err(RunnerError::Config(format!(
                        "backend.url must be a ws:// or wss:// url, got '{}'",
                        self.backend.url
                    )));
                }
            }
            TransportKind::Lines => {
                if self.backend.address.trim().is_empty() {
                    return Err(RunnerError::Config("backend.address must not be empty".to_string()));
                }
            }
        }
        if self.session.response_timeout_ms == 0 {
            return Err(RunnerError::Config("session.response_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            response_timeout: Duration::from_millis(self.session.response_timeout_ms),
            expect_greeting: self.session.expect_greeting,
        }
    }

    /// Connector for the configured transport
    pub fn connector(&self) -> Arc<dyn Connector> {
        match self.backend.transport {
            TransportKind::WebSocket => Arc::new(self.ws_connector()),
            TransportKind::Lines => Arc::new(self.tcp_connector()),
        }
    }

    pub fn ws_connector(&self) -> WsConnector {
        WsConnector::new(
            self.backend.url.clone(),
            Duration::from_millis(self.backend.connect_timeout_ms),
        )
    }

    pub fn tcp_connector(&self) -> TcpConnector {
        TcpConnector::new(
            self.backend.address.clone(),
            Duration::from_millis(self.backend.connect_timeout_ms),
        )
    }

    /// The `defaults` token tree built from the fixtures
    pub fn defaults_token(&self) -> RunnerResult<Value> {
        Ok(serde_json::json!({
            "database_connections": serde_json::to_value(&self.fixtures.database_connections)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.backend.transport, TransportKind::WebSocket);
        assert_eq!(config.backend.url, "ws://127.0.0.1:8000/ws1.ws");
        assert_eq!(config.ws_connector().url, "ws://127.0.0.1:8000/ws1.ws");
        assert_eq!(config.session.response_timeout_ms, 10_000);
        assert!(config.session.expect_greeting);
        assert_eq!(config.fixtures.database_connections["mysql"].port, 3306);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = RunnerConfig::from_toml_str(
            r#"
[backend]
transport = "lines"
address = "10.0.0.5:8000"

[session]
response_timeout_ms = 2500

[fixtures.database_connections.mysql]
scheme = "mysql"
user = "root"
password = "secret"
host = "db"
port = 3307
portX = 33070
"#,
        )
        .unwrap();
        assert_eq!(config.backend.transport, TransportKind::Lines);
        assert_eq!(config.backend.address, "10.0.0.5:8000");
        assert_eq!(config.tcp_connector().address, "10.0.0.5:8000");
        assert_eq!(config.backend.connect_timeout_ms, 5000);
        assert_eq!(config.session.response_timeout_ms, 2500);

        let mysql = &config.fixtures.database_connections["mysql"];
        assert_eq!(mysql.uri(), "mysql://root@db:3307");
        assert_eq!(mysql.extra.get("portX"), Some(&Value::from(33070)));
        assert!(!config.fixtures.database_connections.contains_key("sqlite"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        config
            .apply_overrides(|key| match key {
                ENV_BACKEND_ADDR => Some("backend:9000".to_string()),
                ENV_BACKEND_URL => Some("ws://backend:9000/ws1.ws".to_string()),
                ENV_RESPONSE_TIMEOUT_MS => Some("1500".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.backend.address, "backend:9000");
        assert_eq!(config.backend.url, "ws://backend:9000/ws1.ws");
        assert_eq!(config.session_options().response_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_bad_timeout_override_rejected() {
        let mut config = RunnerConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_RESPONSE_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_websocket_url_validated() {
        let err = RunnerConfig::from_toml_str("[backend]\nurl = \"http://localhost:8000\"\n").unwrap_err();
        assert!(matches!(err, RunnerError::Config(m) if m.contains("backend.url")));
        assert!(RunnerConfig::from_toml_str("[backend]\ntransport = \"lines\"\nurl = \"\"\n").is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(RunnerConfig::from_toml_str("[session]\nresponse_timeout_ms = 0\n").is_err());
    }

    #[test]
    fn test_defaults_token_shape() {
        let token = RunnerConfig::default().defaults_token().unwrap();
        assert_eq!(token["database_connections"]["mysql"]["user"], "root");
        assert_eq!(token["database_connections"]["sqlite"]["scheme"], "sqlite");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("runner.toml");
        let mut config = RunnerConfig::default();
        config.backend.address = "example:1".to_string();
        config.save(&path).unwrap();
        let loaded = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.backend.address, "example:1");
    }
}
