//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SENDIT_HTTP_LISTEN`, `SENDIT_SSH_LISTEN`,
//!    `SENDIT_PUBLIC_URL`, `SENDIT_HOST_KEY`
//! 2. **Config file** — path via `--config <path>`, or `sendit.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [http]
//! listen = "0.0.0.0:5000"
//! public_url = "https://hooks.example.com"
//! max_payload_bytes = 1048576   # 1 MB
//! delivery_timeout_ms = 5000
//!
//! [ssh]
//! listen = "0.0.0.0:2222"
//! host_key_path = "keys/privatekey"
//! server_id = "SSH-2.0-sendit"
//! public_host = "hooks.example.com"
//! public_port = 2222
//! inactivity_timeout_secs = 0   # 0 = never
//! max_protocol_violations = 5
//!
//! [relay]
//! channel_capacity = 64
//! claim_attempts = 8
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors raised while loading configuration. Always fatal at boot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Webhook intake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address to bind (default `0.0.0.0:5000`).
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// Scheme + host prefix of callback URLs handed to sessions
    /// (default `http://localhost:5000`). Override with `SENDIT_PUBLIC_URL`.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Largest accepted webhook body in bytes (default 1 MB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// How long a webhook waits for room in a full channel (default 5000 ms).
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

/// Interactive session transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address to bind (default `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Private host key, OpenSSH or PKCS#8 PEM (default `keys/privatekey`).
    #[serde(default = "default_host_key_path")]
    pub host_key_path: String,
    /// Version string sent during the SSH handshake.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Hostname shown in the reconnect command (default `localhost`).
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Port shown in the reconnect command (default 2222).
    #[serde(default = "default_public_port")]
    pub public_port: u16,
    /// Drop connections idle for this long. 0 disables (default).
    #[serde(default)]
    pub inactivity_timeout_secs: u64,
    /// Malformed claim lines tolerated before the session is closed (default 5).
    #[serde(default = "default_max_protocol_violations")]
    pub max_protocol_violations: usize,
}

/// Registry tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Payloads buffered per identifier before producers wait (default 64).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Identifier generation attempts per claim before giving up (default 8).
    #[serde(default = "default_claim_attempts")]
    pub claim_attempts: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_public_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024 // 1 MB
}
fn default_delivery_timeout_ms() -> u64 {
    5000
}
fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}
fn default_host_key_path() -> String {
    "keys/privatekey".to_string()
}
fn default_server_id() -> String {
    "SSH-2.0-sendit".to_string()
}
fn default_public_host() -> String {
    "localhost".to_string()
}
fn default_public_port() -> u16 {
    2222
}
fn default_max_protocol_violations() -> usize {
    5
}
fn default_channel_capacity() -> usize {
    64
}
fn default_claim_attempts() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            public_url: default_public_url(),
            max_payload_bytes: default_max_payload_bytes(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: default_ssh_listen(),
            host_key_path: default_host_key_path(),
            server_id: default_server_id(),
            public_host: default_public_host(),
            public_port: default_public_port(),
            inactivity_timeout_secs: 0,
            max_protocol_violations: default_max_protocol_violations(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            claim_attempts: default_claim_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl HttpConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Public callback URL for `id`: `<public_url>/<id>`.
    pub fn webhook_url(&self, id: &str) -> String {
        format!("{}/{id}", self.public_url.trim_end_matches('/'))
    }
}

impl SshConfig {
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0)
            .then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }

    /// Command line that opens a session and claims in one step.
    pub fn connect_command(&self) -> String {
        if self.public_port == 22 {
            format!("ssh {} init", self.public_host)
        } else {
            format!("ssh -p {} {} init", self.public_port, self.public_host)
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `sendit.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("sendit.toml").exists() => Self::from_file("sendit.toml")?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("SENDIT_HTTP_LISTEN") {
            config.http.listen = listen;
        }
        if let Ok(listen) = std::env::var("SENDIT_SSH_LISTEN") {
            config.ssh.listen = listen;
        }
        if let Ok(url) = std::env::var("SENDIT_PUBLIC_URL") {
            config.http.public_url = url;
        }
        if let Ok(key) = std::env::var("SENDIT_HOST_KEY") {
            config.ssh.host_key_path = key;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
