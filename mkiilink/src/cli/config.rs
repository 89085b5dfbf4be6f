//! Command-line interface configuration
//!
//! Settings are read from `mkiilink.toml`, looked up in the current
//! directory, then its parent, then the user's configuration directory.
//! Command-line arguments always take precedence over the file.
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyACM0"
//! baudrate = 115200
//!
//! [link]
//! format = "esp3"
//!
//! [bootloader]
//! program_address = 0x08020400
//!
//! [forward]
//! udp_port = 61393
//! ```

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

use crate::{
    codec::WireFormat,
    command::PROGRAM_CHUNK_SIZE,
    error::Error,
    flash::APPLICATION_START_ADDR,
    frame::HOST_FRAME_MAX_SIZE,
};

const CONFIG_FILE: &str = "mkiilink.toml";

/// Port the host forwards data strings to unless configured otherwise
pub const DEFAULT_UDP_PORT: u16 = 61393;

/// Serial port settings
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    pub baudrate: Option<u32>,
}

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

impl UsbDevice {
    /// Check if the given USB port matches this device
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

/// Framing used on the link
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Link {
    pub format: WireFormat,
    /// Largest frame the host will buffer
    pub max_frame_size: usize,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            format: WireFormat::default(),
            max_frame_size: HOST_FRAME_MAX_SIZE,
        }
    }
}

/// Defaults for `bootload`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Bootloader {
    pub program_address: u32,
    pub chunk_size: usize,
    pub allow_unsafe: bool,
}

impl Default for Bootloader {
    fn default() -> Self {
        Bootloader {
            program_address: APPLICATION_START_ADDR,
            chunk_size: PROGRAM_CHUNK_SIZE,
            allow_unsafe: false,
        }
    }
}

/// Where received data strings are forwarded
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Forward {
    pub udp_port: u16,
}

impl Default for Forward {
    fn default() -> Self {
        Forward {
            udp_port: DEFAULT_UDP_PORT,
        }
    }
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub connection: Connection,
    pub link: Link,
    pub bootloader: Bootloader,
    pub forward: Forward,
    /// Preferred USB devices
    pub usb_device: Vec<UsbDevice>,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration file, if there is one.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.save_path = path;

        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    /// Load configuration from `path`, defaulting when it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let Ok(raw_data) = read_to_string(path) else {
            return Ok(Config::default());
        };

        Self::parse(&raw_data)
            .wrap_err_with(|| format!("Failed to load config from {}", path.display()))
    }

    /// Parse the contents of a configuration file. Unknown keys are rejected.
    pub fn parse(raw_data: &str) -> Result<Self> {
        toml::from_str(raw_data).into_diagnostic()
    }

    /// Save the configuration after applying `modify_fn`
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = self.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }

    fn config_path() -> Result<PathBuf, Error> {
        let local_config = std::env::current_dir()?.join(CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }

        if let Some(parent_folder) = std::env::current_dir()?.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        match ProjectDirs::from("org", "sonyc", "mkiilink") {
            Some(dirs) => Ok(dirs.config_dir().join(CONFIG_FILE)),
            None => Ok(local_config),
        }
    }
}
