use std::{net::SocketAddr, str::FromStr, time::Duration};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid chat setting: {0}")]
    InvalidChatSetting(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Settings for the connection authenticator. The signing key is the
/// base64url-encoded 32-byte ed25519 seed shared with the token-minting
/// service; without one the server generates an ephemeral key, which only
/// makes sense for local development.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub signing_key: Option<String>,
}

/// Knobs for the chat transport and its background loops.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    /// Whether the sender receives its own `new_message` echo in addition
    /// to the `message_sent` acknowledgement.
    pub echo_to_sender: bool,
    /// Whether plain sends enqueue a delivery-queue entry for each offline
    /// participant. Scheduled promotions always enqueue.
    pub queue_offline_deliveries: bool,
    pub max_connections: usize,
    pub delivery_interval_secs: u64,
    pub delivery_batch_size: i64,
    pub delivery_max_attempts: i32,
    pub scheduled_interval_secs: u64,
    pub scheduled_batch_size: i64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            queue_offline_deliveries: false,
            max_connections: 256,
            delivery_interval_secs: 5,
            delivery_batch_size: 50,
            delivery_max_attempts: 3,
            scheduled_interval_secs: 60,
            scheduled_batch_size: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ChatConfig {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_secs(self.delivery_interval_secs)
    }

    pub fn scheduled_interval(&self) -> Duration {
        Duration::from_secs(self.scheduled_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub auth: AuthConfig,
    pub chat: ChatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            auth: AuthConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

/// Values supplied on the command line, applied on top of file and
/// environment sources.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub auth_signing_key: Option<String>,
    pub echo_to_sender: Option<bool>,
    pub queue_offline_deliveries: Option<bool>,
    pub delivery_interval_secs: Option<u64>,
    pub scheduled_interval_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "CREWLINE_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of `CREWLINE_SERVER__*` variables present in the environment,
    /// for startup logging.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .filter_map(|(key, _)| {
                key.strip_prefix(&prefix)
                    .map(|rest| rest.to_ascii_lowercase())
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(database_url) = &overrides.database_url {
            self.database_url = Some(database_url.clone());
        }
        if let Some(signing_key) = &overrides.auth_signing_key {
            self.auth.signing_key = Some(signing_key.clone());
        }
        if let Some(echo) = overrides.echo_to_sender {
            self.chat.echo_to_sender = echo;
        }
        if let Some(queue) = overrides.queue_offline_deliveries {
            self.chat.queue_offline_deliveries = queue;
        }
        if let Some(secs) = overrides.delivery_interval_secs {
            self.chat.delivery_interval_secs = secs;
        }
        if let Some(secs) = overrides.scheduled_interval_secs {
            self.chat.scheduled_interval_secs = secs;
        }
        if let Some(secs) = overrides.heartbeat_interval_secs {
            self.chat.heartbeat_interval_secs = secs;
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if self.chat.delivery_interval_secs == 0
            || self.chat.scheduled_interval_secs == 0
            || self.chat.heartbeat_interval_secs == 0
        {
            return Err(ConfigError::InvalidChatSetting(
                "loop intervals must be at least one second".into(),
            ));
        }
        if self.chat.delivery_max_attempts < 1 {
            return Err(ConfigError::InvalidChatSetting(
                "delivery_max_attempts must be at least 1".into(),
            ));
        }
        if self.chat.delivery_batch_size < 1 || self.chat.scheduled_batch_size < 1 {
            return Err(ConfigError::InvalidChatSetting(
                "batch sizes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults_match_expectations() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(config.database_url.is_none());
        assert!(!config.chat.echo_to_sender);
        assert!(!config.chat.queue_offline_deliveries);
        assert_eq!(config.chat.delivery_interval_secs, 5);
        assert_eq!(config.chat.delivery_batch_size, 50);
        assert_eq!(config.chat.delivery_max_attempts, 3);
        assert_eq!(config.chat.scheduled_interval_secs, 60);
        assert_eq!(config.chat.heartbeat_interval_secs, 30);
    }

    #[test]
    #[serial]
    fn environment_overrides_take_effect() {
        env::set_var("CREWLINE_SERVER__HOST", "127.0.0.1");
        env::set_var("CREWLINE_SERVER__PORT", "9090");
        env::set_var("CREWLINE_SERVER__LOG_FORMAT", "json");
        env::set_var("CREWLINE_SERVER__CHAT__ECHO_TO_SENDER", "true");

        let config = ServerConfig::load().expect("config loads");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.chat.echo_to_sender);

        let keys = ServerConfig::environment_override_keys();
        assert!(keys.contains(&"host".to_string()));
        assert!(keys.contains(&"chat__echo_to_sender".to_string()));

        env::remove_var("CREWLINE_SERVER__HOST");
        env::remove_var("CREWLINE_SERVER__PORT");
        env::remove_var("CREWLINE_SERVER__LOG_FORMAT");
        env::remove_var("CREWLINE_SERVER__CHAT__ECHO_TO_SENDER");
    }

    #[test]
    #[serial]
    fn listener_addr_prefers_bind_addr() {
        env::set_var("CREWLINE_SERVER__BIND_ADDR", "192.168.1.20:5555");

        let config = ServerConfig::load().expect("config loads");
        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "192.168.1.20:5555");

        env::remove_var("CREWLINE_SERVER__BIND_ADDR");
    }

    #[test]
    fn listener_addr_composes_host_and_port() {
        let config = ServerConfig {
            host: "10.0.0.2".into(),
            port: 7000,
            ..ServerConfig::default()
        };

        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "10.0.0.2:7000");
    }

    #[test]
    fn overrides_are_validated() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_overrides(&CliOverrides {
                heartbeat_interval_secs: Some(0),
                ..CliOverrides::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChatSetting(_)));

        let mut config = ServerConfig::default();
        config
            .apply_overrides(&CliOverrides {
                port: Some(9999),
                echo_to_sender: Some(true),
                ..CliOverrides::default()
            })
            .expect("valid overrides");
        assert_eq!(config.port, 9999);
        assert!(config.chat.echo_to_sender);
    }

    #[test]
    #[serial]
    fn invalid_bind_addr_returns_error() {
        env::set_var("CREWLINE_SERVER__BIND_ADDR", "::invalid::");

        let config = ServerConfig::load().expect("config loads");
        let err = config.listener_addr().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr(_)));

        env::remove_var("CREWLINE_SERVER__BIND_ADDR");
    }
}
