//! Persisted run configuration for the emulator (`qemu.conf`).
//!
//! The file is flat `KEY=value` text, one entry per line, with `#` comments:
//!
//! ```text
//! # Memory in MB (128-1024 recommended)
//! RAM_MB=512
//! BOOT_DEVICE=d
//! ```
//!
//! Loading is lenient: unknown keys are ignored and malformed values fall back
//! to their defaults, with a [`ConfigError::InvalidValue`] reported alongside
//! the loaded configuration. Saving is atomic (temp file + rename) so a
//! concurrent reader never observes a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Keys and defaults
// ---------------------------------------------------------------------------

pub const KEY_RAM_MB: &str = "RAM_MB";
pub const KEY_BOOT_DEVICE: &str = "BOOT_DEVICE";
pub const KEY_SCREEN_WIDTH: &str = "SCREEN_WIDTH";
pub const KEY_SCREEN_HEIGHT: &str = "SCREEN_HEIGHT";
pub const KEY_VNC_DISPLAY: &str = "VNC_DISPLAY";
pub const KEY_SOUND_ENABLED: &str = "SOUND_ENABLED";
pub const KEY_PRIMARY_DISK: &str = "PRIMARY_DISK";
pub const KEY_SECONDARY_DISK: &str = "SECONDARY_DISK";
pub const KEY_CDROM_ISO: &str = "CDROM_ISO";

pub const DEFAULT_MEMORY_MB: u32 = 512;
pub const DEFAULT_SCREEN_WIDTH: u32 = 1024;
pub const DEFAULT_SCREEN_HEIGHT: u32 = 768;
pub const DEFAULT_PRIMARY_DISK: &str = "macos9.qcow2";
pub const DEFAULT_CDROM_ISO: &str = "macos_921_ppc.iso";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which device the guest firmware boots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Hard disk (`-boot c`).
    Disk,
    /// CD-ROM (`-boot d`).
    Cdrom,
}

impl BootDevice {
    /// The single-letter code used both in `qemu.conf` and on the emulator
    /// command line.
    pub fn code(self) -> &'static str {
        match self {
            BootDevice::Disk => "c",
            BootDevice::Cdrom => "d",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "c" | "disk" => Some(BootDevice::Disk),
            "d" | "cdrom" => Some(BootDevice::Cdrom),
            _ => None,
        }
    }
}

/// The mutable run configuration of the emulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub memory_mb: u32,
    pub boot_device: BootDevice,
    pub screen_width: u32,
    pub screen_height: u32,
    /// VNC display number (`-vnc :N`).
    pub display_index: u32,
    pub sound_enabled: bool,
    /// Relative paths resolve against the disk image directory.
    pub primary_disk: Option<PathBuf>,
    pub secondary_disk: Option<PathBuf>,
    /// Relative paths resolve against the ISO directory.
    pub cdrom: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            boot_device: BootDevice::Cdrom,
            screen_width: DEFAULT_SCREEN_WIDTH,
            screen_height: DEFAULT_SCREEN_HEIGHT,
            display_index: 0,
            sound_enabled: false,
            primary_disk: Some(PathBuf::from(DEFAULT_PRIMARY_DISK)),
            secondary_disk: None,
            cdrom: Some(PathBuf::from(DEFAULT_CDROM_ISO)),
        }
    }
}

impl Configuration {
    /// Check the numeric invariants (`memory_mb`, width and height > 0) and
    /// that no path would break the line-based file format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = [
            (KEY_PRIMARY_DISK, &self.primary_disk),
            (KEY_SECONDARY_DISK, &self.secondary_disk),
            (KEY_CDROM_ISO, &self.cdrom),
        ];
        for (key, path) in paths {
            let Some(path) = path else { continue };
            let value = path.display().to_string();
            if has_line_break(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                });
            }
        }

        let positive = [
            (KEY_RAM_MB, self.memory_mb),
            (KEY_SCREEN_WIDTH, self.screen_width),
            (KEY_SCREEN_HEIGHT, self.screen_height),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Apply a single `KEY=value` assignment.
    ///
    /// On an invalid value the field is left untouched and the error is
    /// returned, so callers can keep the previous (or default) value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        if has_line_break(value) {
            return Err(invalid());
        }
        match key {
            KEY_RAM_MB => self.memory_mb = parse_positive(value).ok_or_else(invalid)?,
            KEY_BOOT_DEVICE => self.boot_device = BootDevice::parse(value).ok_or_else(invalid)?,
            KEY_SCREEN_WIDTH => self.screen_width = parse_positive(value).ok_or_else(invalid)?,
            KEY_SCREEN_HEIGHT => self.screen_height = parse_positive(value).ok_or_else(invalid)?,
            KEY_VNC_DISPLAY => self.display_index = value.parse().map_err(|_| invalid())?,
            KEY_SOUND_ENABLED => self.sound_enabled = parse_flag(value).ok_or_else(invalid)?,
            KEY_PRIMARY_DISK => self.primary_disk = optional_path(value),
            KEY_SECONDARY_DISK => self.secondary_disk = optional_path(value),
            KEY_CDROM_ISO => self.cdrom = optional_path(value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Render the configuration in the persisted file format.
    pub fn to_file_contents(&self) -> String {
        fn path_value(path: &Option<PathBuf>) -> String {
            path.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        }

        let mut out = String::new();
        out.push_str("# Mac OS 9 emulator configuration\n");
        out.push_str("# Edit these values and restart the emulator\n\n");
        out.push_str("# Memory in MB (128-1024 recommended)\n");
        out.push_str(&format!("{KEY_RAM_MB}={}\n\n", self.memory_mb));
        out.push_str("# Boot device: d=cdrom, c=hard disk\n");
        out.push_str(&format!("{KEY_BOOT_DEVICE}={}\n\n", self.boot_device.code()));
        out.push_str("# Display resolution\n");
        out.push_str(&format!("{KEY_SCREEN_WIDTH}={}\n", self.screen_width));
        out.push_str(&format!("{KEY_SCREEN_HEIGHT}={}\n\n", self.screen_height));
        out.push_str("# VNC display number\n");
        out.push_str(&format!("{KEY_VNC_DISPLAY}={}\n\n", self.display_index));
        out.push_str("# Sound (0=disabled, 1=enabled)\n");
        out.push_str(&format!(
            "{KEY_SOUND_ENABLED}={}\n\n",
            if self.sound_enabled { 1 } else { 0 }
        ));
        out.push_str("# Disk configuration\n");
        out.push_str(&format!("{KEY_PRIMARY_DISK}={}\n", path_value(&self.primary_disk)));
        out.push_str(&format!("{KEY_SECONDARY_DISK}={}\n", path_value(&self.secondary_disk)));
        out.push_str(&format!("{KEY_CDROM_ISO}={}\n", path_value(&self.cdrom)));
        out
    }
}

/// Errors raised while reading, editing or writing the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown configuration key {0}")]
    UnknownKey(String),

    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of [`ConfigStore::load`]: always a usable configuration, plus the
/// problems that were papered over with defaults.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Configuration,
    pub warnings: Vec<ConfigError>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_positive(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|v| *v > 0)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\n', '\r'])
}

fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

/// Parse `KEY=value` text on top of the defaults.
///
/// Never fails: every problem becomes a warning and the affected field keeps
/// its default.
pub fn parse(text: &str) -> ConfigLoad {
    let mut config = Configuration::default();
    let mut warnings = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "ignoring config line without '='");
            continue;
        };
        match config.set(key.trim(), value.trim()) {
            Ok(()) => {}
            Err(ConfigError::UnknownKey(key)) => {
                debug!(key = %key, "ignoring unknown config key");
            }
            Err(e) => warnings.push(e),
        }
    }

    ConfigLoad { config, warnings }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reads and writes the configuration file at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration, falling back to defaults for
    /// anything missing or malformed.
    pub fn load(&self) -> ConfigLoad {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let loaded = parse(&text);
                for w in &loaded.warnings {
                    warn!(path = %self.path.display(), error = %w, "config value replaced by default");
                }
                loaded
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigLoad {
                config: Configuration::default(),
                warnings: Vec::new(),
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config unreadable, using defaults");
                ConfigLoad {
                    config: Configuration::default(),
                    warnings: vec![ConfigError::Io {
                        path: self.path.clone(),
                        source: e,
                    }],
                }
            }
        }
    }

    /// Atomically replace the file with `config`.
    pub fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(config.to_file_contents().as_bytes())
            .map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }

    /// Validate and persist a new configuration.
    ///
    /// A running instance keeps the configuration it was launched with.
    pub fn update(&self, config: &Configuration) -> Result<(), ConfigError> {
        config.validate()?;
        self.save(config)
    }

    /// Load, apply one `KEY=value` edit, and save.
    pub fn set(&self, key: &str, value: &str) -> Result<Configuration, ConfigError> {
        let mut config = self.load().config;
        config.set(key, value)?;
        self.update(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
