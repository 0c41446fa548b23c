// src/config.rs
//! Connection address parsing and persisted application settings

use crate::error::{GpsError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ADDRESS: &str = "192.168.43.1:2947";
pub const DEFAULT_HOST: &str = "192.168.43.1";
pub const DEFAULT_PORT: u16 = 2947;

/// Latitude/longitude delta applied by one directional nudge, in degrees
pub const DEFAULT_MOVE_STEP: f64 = 0.00002;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Where the gpsd daemon lives. Read once when a feed session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address in a form accepted by `TcpStream::connect`
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_address())
    }
}

impl FromStr for ConnectionConfig {
    type Err = GpsError;

    /// Parse `"host:port"`; IPv6 hosts must be bracketed (`[::1]:2947`)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| GpsError::Config(format!("expected host:port, got '{}'", s)))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| GpsError::Config(format!("unterminated '[' in '{}'", s)))?,
            None if host.contains(':') => {
                return Err(GpsError::Config(format!(
                    "IPv6 host must be bracketed in '{}'",
                    s
                )))
            }
            None => host,
        };

        if host.is_empty() {
            return Err(GpsError::Config(format!("missing host in '{}'", s)));
        }

        let port: u16 = port
            .parse()
            .map_err(|e| GpsError::Config(format!("invalid port '{}': {}", port, e)))?;
        if port == 0 {
            return Err(GpsError::Config("port must be non-zero".to_string()));
        }

        Ok(Self::new(host, port))
    }
}

/// Parse a user-entered nudge step in degrees
pub fn parse_move_step(text: &str) -> Result<f64> {
    let step: f64 = text
        .trim()
        .parse()
        .map_err(|e| GpsError::Config(format!("invalid move step '{}': {}", text.trim(), e)))?;

    if !step.is_finite() || step <= 0.0 {
        return Err(GpsError::Config(format!(
            "move step must be a positive number, got {}",
            step
        )));
    }
    Ok(step)
}

/// Settings the host application persists between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_move_step")]
    pub move_step: f64,
}

fn default_address() -> String { DEFAULT_ADDRESS.to_string() }
fn default_move_step() -> f64 { DEFAULT_MOVE_STEP }

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            move_step: default_move_step(),
        }
    }
}

impl AppSettings {
    /// Load settings from the per-user config file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save settings to the per-user config file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| GpsError::Config(format!("Failed to read config file: {}", e)))?;

        let settings: Self = serde_json::from_str(&contents)
            .map_err(|e| GpsError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GpsError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let contents = serde_json::to_string_pretty(self)?;

        std::fs::write(path, contents)
            .map_err(|e| GpsError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| GpsError::Config("HOME environment variable not set".to_string()))?;

        Ok(PathBuf::from(home).join(".config").join("fake-gps").join("config.json"))
    }

    /// The stored address, validated
    pub fn connection(&self) -> Result<ConnectionConfig> {
        self.address.parse()
    }

    pub fn update_address(&mut self, address: &str) -> Result<()> {
        address.parse::<ConnectionConfig>()?;
        self.address = address.trim().to_string();
        Ok(())
    }

    pub fn update_move_step(&mut self, text: &str) -> Result<()> {
        self.move_step = parse_move_step(text)?;
        Ok(())
    }
}
