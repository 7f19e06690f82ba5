//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    mcp: McpConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    /// Origins allowed by CORS and by the MCP origin check (empty = any for CORS)
    #[serde(default)]
    cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

/// Settings for the MCP Streamable HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpConfig {
    /// Route serving POST, GET and DELETE.
    pub endpoint: String,
    /// Name reported in `serverInfo` on initialize.
    pub server_name: String,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
    /// Number of server-to-client events kept per session for resumption.
    pub event_buffer_size: usize,
    /// Chunks buffered between the transport and a slow SSE reader.
    pub stream_channel_capacity: usize,
    /// Sessions idle for longer than this are closed. `0` disables reaping.
    pub session_idle_timeout_secs: u64,
    /// How often the reaper looks for idle sessions.
    pub reaper_interval_secs: u64,
    /// Reject browser requests from non-local, non-allowed origins.
    pub validate_origin: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/mcp/sse".to_string(),
            server_name: "aido-mcp-server".to_string(),
            keep_alive_secs: 15,
            event_buffer_size: 256,
            stream_channel_capacity: 64,
            session_idle_timeout_secs: 3600,
            reaper_interval_secs: 60,
            validate_origin: true,
        }
    }
}

impl McpConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    /// Idle timeout, or `None` when reaping is disabled.
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    aido_types::DEFAULT_PORT
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allowed CORS origins (empty = any origin)
    pub cors_allowed_origins: Vec<String>,
    /// MCP endpoint settings
    pub mcp: McpConfig,
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/aido-mcp/ on Linux)
    /// 2. `.aido-mcp.toml` in current directory
    ///
    /// Environment variables use the `AIDO_` prefix with `__` between section and
    /// key, e.g. `AIDO_SERVER__PORT` or `AIDO_MCP__KEEP_ALIVE_SECS`.
    pub fn from_figment(
        host: Option<String>,
        port: Option<u16>,
        endpoint: Option<String>,
        log_level: Option<String>,
    ) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".aido-mcp.toml"));
        let user_config = directories::ProjectDirs::from("", "", "aido-mcp")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // Priority: defaults < user config < local config < env vars < CLI args
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("AIDO_").split("__"));

        if let Some(ref h) = host {
            figment = figment.merge(Serialized::default("server.host", h));
        }
        if let Some(p) = port {
            figment = figment.merge(Serialized::default("server.port", p));
        }
        if let Some(ref e) = endpoint {
            figment = figment.merge(Serialized::default("mcp.endpoint", e));
        }
        if let Some(ref l) = log_level {
            figment = figment.merge(Serialized::default("logging.log_level", l));
        }

        let config_file: ConfigFile = figment.extract()?;
        Ok(Self::from(config_file))
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            host: file.server.host,
            port: file.server.port,
            cors_allowed_origins: file.server.cors_allowed_origins,
            mcp: file.mcp,
            log_file: file.logging.log_file,
            log_level: file.logging.log_level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from(ConfigFile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn clear_env() {
        for key in [
            "AIDO_SERVER__PORT",
            "AIDO_SERVER__HOST",
            "AIDO_MCP__ENDPOINT",
            "AIDO_MCP__KEEP_ALIVE_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_figment_defaults() {
        clear_env();

        // Run in a temp directory to avoid picking up a project .aido-mcp.toml
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(config.port, aido_types::DEFAULT_PORT);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.mcp, McpConfig::default());
        assert!(config.log_file.is_none());
    }

    #[test]
    #[serial]
    fn test_from_figment_cli_args_override() {
        clear_env();

        let config = Config::from_figment(
            Some("127.0.0.1".to_string()),
            Some(9000),
            Some("/mcp".to_string()),
            Some("debug".to_string()),
        )
        .unwrap();

        assert_eq!(config.server_address(), "127.0.0.1:9000");
        assert_eq!(config.mcp.endpoint, "/mcp");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    #[serial]
    fn test_from_figment_config_file() {
        clear_env();

        let temp_dir = TempDir::new().unwrap();
        let config_content = r#"
[server]
port = 7777
cors_allowed_origins = ["https://aido.example"]

[mcp]
keep_alive_secs = 5
session_idle_timeout_secs = 0
"#;
        fs::write(temp_dir.path().join(".aido-mcp.toml"), config_content).unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(config.port, 7777);
        assert_eq!(config.cors_allowed_origins, vec!["https://aido.example"]);
        assert_eq!(config.mcp.keep_alive(), Duration::from_secs(5));
        assert_eq!(config.mcp.session_idle_timeout(), None);
        // Unset keys keep their defaults
        assert_eq!(config.mcp.endpoint, "/api/mcp/sse");
    }

    #[test]
    #[serial]
    fn test_from_figment_env_vars_override_config_file() {
        clear_env();

        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(".aido-mcp.toml"),
            "[server]\nport = 7777\n[mcp]\nkeep_alive_secs = 5",
        )
        .unwrap();

        std::env::set_var("AIDO_SERVER__PORT", "8888");
        std::env::set_var("AIDO_MCP__KEEP_ALIVE_SECS", "30");

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(&original_dir);
        clear_env();

        assert_eq!(config.port, 8888);
        assert_eq!(config.mcp.keep_alive_secs, 30);
    }

    #[test]
    #[serial]
    fn test_from_figment_cli_overrides_env() {
        clear_env();
        std::env::set_var("AIDO_SERVER__PORT", "8888");

        let config = Config::from_figment(None, Some(9999), None, None).unwrap();

        clear_env();

        assert_eq!(config.port, 9999);
    }
}
