//! Configuration (C6, ambient): an INI-like `[Server]/[Connection]/[Database]`
//! key=value file with documented defaults, matching spec.md §6.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub user_authentication: bool,
    pub proxy_port: u16,
    pub node_connection_port: u16,
    pub management_connection_port: u16,
    pub polling_node_connection_timeout: Duration,
    pub working_node_connection_timeout: Duration,
    pub connection_exception_threshold: u32,
    pub proxy_timeout_ms: u64,
    pub message_chunk_buffer_size: usize,
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user_authentication: false,
            proxy_port: 6666,
            node_connection_port: 7777,
            management_connection_port: 6668,
            polling_node_connection_timeout: Duration::from_secs(10),
            working_node_connection_timeout: Duration::from_secs(300),
            connection_exception_threshold: 5,
            proxy_timeout_ms: 60_000,
            message_chunk_buffer_size: 16 * 1024,
            database_url: "sqlite://hive.sqlite3".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, or writes the defaults out and returns them if the
    /// file does not exist (§6: "a missing file is created with defaults").
    /// An existing-but-malformed file is `Fatal` — we do not guess at it.
    pub fn load_or_init(path: &Path) -> Result<Config> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(Error::fatal),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                std::fs::write(path, config.render()).map_err(Error::fatal)?;
                Ok(config)
            }
            Err(e) => Err(Error::fatal(e)),
        }
    }

    fn parse(text: &str) -> std::result::Result<Config, String> {
        let mut kv: HashMap<String, String> = HashMap::new();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(inner) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = inner.trim().to_string();
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value, got {:?}", lineno + 1, raw))?;
            kv.insert(
                format!("{}.{}", section, key.trim()),
                value.trim().to_string(),
            );
        }

        let defaults = Config::default();
        let get_bool = |k: &str, d: bool| -> std::result::Result<bool, String> {
            match kv.get(k) {
                None => Ok(d),
                Some(v) => v
                    .parse()
                    .map_err(|_| format!("{k}: expected true/false, got {v:?}")),
            }
        };
        let get_u16 = |k: &str, d: u16| -> std::result::Result<u16, String> {
            match kv.get(k) {
                None => Ok(d),
                Some(v) => v.parse().map_err(|_| format!("{k}: expected u16, got {v:?}")),
            }
        };
        let get_u64 = |k: &str, d: u64| -> std::result::Result<u64, String> {
            match kv.get(k) {
                None => Ok(d),
                Some(v) => v.parse().map_err(|_| format!("{k}: expected u64, got {v:?}")),
            }
        };
        let get_u32 = |k: &str, d: u32| -> std::result::Result<u32, String> {
            match kv.get(k) {
                None => Ok(d),
                Some(v) => v.parse().map_err(|_| format!("{k}: expected u32, got {v:?}")),
            }
        };
        let get_usize = |k: &str, d: usize| -> std::result::Result<usize, String> {
            match kv.get(k) {
                None => Ok(d),
                Some(v) => v.parse().map_err(|_| format!("{k}: expected usize, got {v:?}")),
            }
        };
        let get_string = |k: &str, d: &str| -> String {
            kv.get(k).cloned().unwrap_or_else(|| d.to_string())
        };

        Ok(Config {
            user_authentication: get_bool("Server.USER_AUTHENTICATION", defaults.user_authentication)?,
            proxy_port: get_u16("Server.PROXY_PORT", defaults.proxy_port)?,
            node_connection_port: get_u16(
                "Server.NODE_CONNECTION_PORT",
                defaults.node_connection_port,
            )?,
            management_connection_port: get_u16(
                "Server.MANAGEMENT_CONNECTION_PORT",
                defaults.management_connection_port,
            )?,
            polling_node_connection_timeout: Duration::from_secs(get_u64(
                "Connection.POLLING_NODE_CONNECTION_TIMEOUT",
                defaults.polling_node_connection_timeout.as_secs(),
            )?),
            working_node_connection_timeout: Duration::from_secs(get_u64(
                "Connection.WORKING_NODE_CONNECTION_TIMEOUT",
                defaults.working_node_connection_timeout.as_secs(),
            )?),
            connection_exception_threshold: get_u32(
                "Connection.CONNECTION_EXCEPTION_THRESHOLD",
                defaults.connection_exception_threshold,
            )?,
            proxy_timeout_ms: get_u64("Connection.PROXY_TIMEOUT_MS", defaults.proxy_timeout_ms)?,
            message_chunk_buffer_size: get_usize(
                "Connection.MESSAGE_CHUNK_BUFFER_SIZE",
                defaults.message_chunk_buffer_size,
            )?,
            database_url: get_string("Database.DATABASE_URL", &defaults.database_url),
        })
    }

    fn render(&self) -> String {
        format!(
            "[Server]\n\
             USER_AUTHENTICATION={}\n\
             PROXY_PORT={}\n\
             NODE_CONNECTION_PORT={}\n\
             MANAGEMENT_CONNECTION_PORT={}\n\
             \n\
             [Connection]\n\
             POLLING_NODE_CONNECTION_TIMEOUT={}\n\
             WORKING_NODE_CONNECTION_TIMEOUT={}\n\
             CONNECTION_EXCEPTION_THRESHOLD={}\n\
             PROXY_TIMEOUT_MS={}\n\
             MESSAGE_CHUNK_BUFFER_SIZE={}\n\
             \n\
             [Database]\n\
             DATABASE_URL={}\n",
            self.user_authentication,
            self.proxy_port,
            self.node_connection_port,
            self.management_connection_port,
            self.polling_node_connection_timeout.as_secs(),
            self.working_node_connection_timeout.as_secs(),
            self.connection_exception_threshold,
            self.proxy_timeout_ms,
            self.message_chunk_buffer_size,
            self.database_url,
        )
    }
}
