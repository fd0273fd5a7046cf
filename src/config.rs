use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5005;
/// Shrunk send buffer: keeps kernel queuing short at the cost of more drops under bursts.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 64 * 1024;
/// One warning per this many dropped datagrams.
pub const DEFAULT_DROP_LOG_INTERVAL: u64 = 100;

pub const CONFIG_PATH_ENV: &str = "DETECTION_CONFIG";
pub const DEST_ADDR_ENV: &str = "DETECTION_DEST_ADDR";
pub const SEND_BUFFER_ENV: &str = "DETECTION_SEND_BUFFER";
pub const DROP_LOG_INTERVAL_ENV: &str = "DETECTION_DROP_LOG_INTERVAL";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ChannelConfigFile {
    destination: Option<DestinationConfigFile>,
    socket: Option<SocketConfigFile>,
    drops: Option<DropConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DestinationConfigFile {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SocketConfigFile {
    send_buffer_size: Option<usize>,
    /// Leave SO_SNDBUF at the OS default. Wins over `send_buffer_size`.
    system_buffer: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DropConfigFile {
    log_interval: Option<u64>,
}

/// Settings for a [`DetectionChannel`](crate::DetectionChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Destination host name or IP literal.
    pub host: String,
    pub port: u16,
    /// `Some(n)` shrinks the socket send buffer to `n` bytes; `None` keeps the OS default.
    pub send_buffer_size: Option<usize>,
    /// Emit one drop warning per this many drops.
    pub drop_log_interval: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            send_buffer_size: Some(DEFAULT_SEND_BUFFER_SIZE),
            drop_log_interval: DEFAULT_DROP_LOG_INTERVAL,
        }
    }
}

impl ChannelConfig {
    /// Load from the file named by `DETECTION_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var(CONFIG_PATH_ENV).ok().as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting the environment.
    pub fn load_file(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_destination(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn with_drop_log_interval(mut self, interval: u64) -> Self {
        self.drop_log_interval = interval;
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn destination(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve the destination once. The first address returned by the resolver wins.
    pub fn resolve_destination(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| anyhow!("failed to resolve destination {}: {}", self.destination(), e))?
            .next()
            .ok_or_else(|| anyhow!("destination {} resolved to no addresses", self.destination()))
    }

    fn from_file(file: ChannelConfigFile) -> Self {
        let defaults = Self::default();
        let host = file
            .destination
            .as_ref()
            .and_then(|dest| dest.host.clone())
            .unwrap_or(defaults.host);
        let port = file
            .destination
            .as_ref()
            .and_then(|dest| dest.port)
            .unwrap_or(defaults.port);
        let send_buffer_size = match file.socket {
            Some(SocketConfigFile {
                system_buffer: Some(true),
                ..
            }) => None,
            Some(SocketConfigFile {
                send_buffer_size: Some(size),
                ..
            }) => Some(size),
            _ => defaults.send_buffer_size,
        };
        let drop_log_interval = file
            .drops
            .and_then(|drops| drops.log_interval)
            .unwrap_or(defaults.drop_log_interval);
        Self {
            host,
            port,
            send_buffer_size,
            drop_log_interval,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var(DEST_ADDR_ENV) {
            if !addr.trim().is_empty() {
                let (host, port) = split_host_port(addr.trim())?;
                self.host = host;
                self.port = port;
            }
        }
        if let Ok(size) = std::env::var(SEND_BUFFER_ENV) {
            if !size.trim().is_empty() {
                self.send_buffer_size = parse_send_buffer(size.trim())?;
            }
        }
        if let Ok(interval) = std::env::var(DROP_LOG_INTERVAL_ENV) {
            if !interval.trim().is_empty() {
                self.drop_log_interval = interval.trim().parse().map_err(|_| {
                    anyhow!("{} must be a positive integer", DROP_LOG_INTERVAL_ENV)
                })?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("destination host must not be empty"));
        }
        if self.send_buffer_size == Some(0) {
            return Err(anyhow!(
                "send_buffer_size must be greater than zero (omit it for the system default)"
            ));
        }
        if self.drop_log_interval == 0 {
            return Err(anyhow!("drop log interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Parse a send buffer override. `default` and `system` select the OS default;
/// a byte count must be greater than zero, as in the config file.
pub fn parse_send_buffer(value: &str) -> Result<Option<usize>> {
    match value.to_ascii_lowercase().as_str() {
        "default" | "system" => Ok(None),
        other => match other.parse::<usize>() {
            Ok(0) => Err(anyhow!(
                "send buffer size must be greater than zero (use 'system' for the OS default)"
            )),
            Ok(size) => Ok(Some(size)),
            Err(_) => Err(anyhow!(
                "send buffer size must be an integer byte count or 'system'"
            )),
        },
    }
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("destination '{}' must be host:port", addr))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("destination '{}' has an invalid port", addr))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(anyhow!("destination '{}' has an empty host", addr));
    }
    Ok((host.to_string(), port))
}

fn read_config_file(path: &Path) -> Result<ChannelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
