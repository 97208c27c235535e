use crate::device::DeviceKind;
use crate::device::serial::{SerialConfig, SerialError};
use crate::protocol::DEFAULT_PORT;
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Which kind of device is attached
    #[serde(default)]
    pub device: DeviceKind,

    /// Serial device to use instead of probing every port
    #[serde(default)]
    pub serial_device: Option<PathBuf>,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Character framing, e.g. "8N1"
    #[serde(default = "default_format")]
    pub format: String,

    /// Hardware RTS/CTS handshake
    #[serde(default)]
    pub rtscts: bool,

    /// UDP port of the command daemon
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host the remote client sends to.
    /// If None, commands are broadcast on the local network.
    #[serde(default)]
    pub host: Option<String>,
}

fn default_baud() -> u32 {
    19200
}

fn default_format() -> String {
    "8N1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            serial_device: None,
            baud: default_baud(),
            format: default_format(),
            rtscts: false,
            port: default_port(),
            host: None,
        }
    }
}

impl Settings {
    /// Load config from ~/.config/avctl/config.toml.
    /// Returns default settings if the file doesn't exist or fails to parse.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            log::warn!("Could not determine config directory, using defaults");
            return Self::default();
        };

        if !path.exists() {
            log::debug!("No config file found at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::debug!("Loaded settings from: {}", path.display());
        Ok(settings)
    }

    pub fn serial_config(&self) -> Result<SerialConfig, SerialError> {
        SerialConfig::new(self.baud, &self.format, self.rtscts)
    }
}

/// Get the config file path
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "avctl").map(|dirs| dirs.config_dir().join("config.toml"))
}
