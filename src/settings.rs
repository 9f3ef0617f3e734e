//! Supervisor settings (`settings.toml`).
//!
//! Distinct from the guest run configuration in `qemu.conf`: these knobs
//! describe how macemu itself behaves (which emulator binary, timeouts,
//! restart policy, where the web API listens). Every field has a default and
//! a partial file overrides only what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths::MacemuPaths;
use crate::vm::command::CommandBuilder;
use crate::vm::lifecycle::SupervisorOptions;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub emulator: EmulatorSettings,
    pub supervisor: SupervisorSettings,
    pub web: WebSettings,
    pub screenshot: ScreenshotSettings,
}

// --- Sub-structs ---

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmulatorSettings {
    pub binary: PathBuf,
    pub machine: String,
    pub audio_backend: String,
    /// Overrides the socket under the run directory.
    pub monitor_socket: Option<PathBuf>,
    /// Clamp the guest resolution to the host display (`xrandr`).
    pub detect_display: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub launch_timeout_ms: u64,
    pub quit_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub restart: RestartSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartKind {
    Never,
    OnCrash,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartSettings {
    pub policy: RestartKind,
    pub max_restarts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind: String,
    /// Launch the emulator when `serve` starts.
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenshotSettings {
    /// PPM-to-PNG filter: reads stdin, writes stdout.
    pub converter: Vec<String>,
    pub wait_ms: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-ppc"),
            machine: "mac99,via=pmu".to_string(),
            audio_backend: "pa".to_string(),
            monitor_socket: None,
            detect_display: true,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 10_000,
            quit_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            restart: RestartSettings::default(),
        }
    }
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            policy: RestartKind::Never,
            max_restarts: 3,
            backoff_ms: 2_000,
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            autostart: false,
        }
    }
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            converter: vec!["pnmtopng".to_string()],
            wait_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and derived values
// ---------------------------------------------------------------------------

impl Settings {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn monitor_socket(&self, paths: &MacemuPaths) -> PathBuf {
        self.emulator
            .monitor_socket
            .clone()
            .unwrap_or_else(|| paths.monitor_socket())
    }

    pub fn supervisor_options(&self, paths: &MacemuPaths) -> SupervisorOptions {
        SupervisorOptions {
            launch_timeout: Duration::from_millis(self.supervisor.launch_timeout_ms),
            quit_timeout: Duration::from_millis(self.supervisor.quit_timeout_ms),
            command_timeout: Duration::from_millis(self.supervisor.command_timeout_ms),
            monitor_socket: self.monitor_socket(paths),
        }
    }

    pub fn command_builder(&self, paths: &MacemuPaths) -> CommandBuilder {
        CommandBuilder {
            emulator: self.emulator.binary.clone(),
            machine: self.emulator.machine.clone(),
            monitor_socket: self.monitor_socket(paths),
            disk_dir: paths.disk.clone(),
            iso_dir: paths.iso.clone(),
            audio_backend: self.emulator.audio_backend.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.emulator.binary, PathBuf::from("qemu-system-ppc"));
        assert_eq!(s.supervisor.launch_timeout_ms, 10_000);
        assert_eq!(s.supervisor.restart.policy, RestartKind::Never);
        assert_eq!(s.web.bind, "127.0.0.1:8080");
        assert_eq!(s.screenshot.converter, vec!["pnmtopng".to_string()]);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let partial = r#"
[supervisor]
quit_timeout_ms = 2500

[supervisor.restart]
policy = "on_crash"
"#;
        let s = Settings::from_toml(partial).expect("partial parse failed");
        assert_eq!(s.supervisor.quit_timeout_ms, 2500);
        assert_eq!(s.supervisor.launch_timeout_ms, 10_000);
        assert_eq!(s.supervisor.restart.policy, RestartKind::OnCrash);
        assert_eq!(s.supervisor.restart.max_restarts, 3);
        assert_eq!(s.emulator.machine, "mac99,via=pmu");
    }

    #[test]
    fn missing_file_means_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Settings::load(&tmp.path().join("settings.toml")).unwrap();
        assert_eq!(s.web.bind, "127.0.0.1:8080");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.toml");
        std::fs::write(&path, "[web]\nbind = 8080 8080\n").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn derived_values_follow_paths() {
        let paths = MacemuPaths::under("/opt/macemu");
        let s = Settings::default();

        let builder = s.command_builder(&paths);
        assert_eq!(builder.disk_dir, PathBuf::from("/opt/macemu/disk"));
        assert_eq!(builder.monitor_socket, paths.monitor_socket());

        let opts = s.supervisor_options(&paths);
        assert_eq!(opts.command_timeout, Duration::from_secs(5));
    }
}
