//! Directory layout for macemu.
//!
//! `MACEMU_HOME` puts everything under one root (a `/opt/macemu` style
//! install):
//!
//! - `config/`       `qemu.conf`, `settings.toml`
//! - `disk/`         disk images
//! - `iso/`          CD-ROM images
//! - `screenshots/`  screendumps and `latest.png`
//! - `run/`          monitor socket
//! - `logs/`         `macemu.log` when `MACEMU_LOG=1`
//!
//! Without it, macOS and XDG conventions apply.

use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "org.macemu";
const APP_NAME: &str = "macemu";

/// All resolved directories.
#[derive(Debug, Clone)]
pub struct MacemuPaths {
    pub config: PathBuf,
    /// Disk images (`*.qcow2`, `*.img`)
    pub disk: PathBuf,
    /// CD-ROM images (`*.iso`)
    pub iso: PathBuf,
    pub screenshots: PathBuf,
    /// Runtime files: the monitor socket
    pub run: PathBuf,
    pub logs: PathBuf,
}

impl MacemuPaths {
    /// Resolve from `MACEMU_HOME`, else from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        if let Some(root) = std::env::var_os("MACEMU_HOME").filter(|v| !v.is_empty()) {
            return Some(Self::under(root));
        }

        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let data = resolve_data_dir(&home);

        Some(Self {
            config: resolve_config_dir(&home),
            disk: data.join("disk"),
            iso: data.join("iso"),
            screenshots: data.join("screenshots"),
            run: resolve_run_dir(&data),
            logs: resolve_log_dir(&home),
        })
    }

    /// Everything below a single root directory.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config"),
            disk: root.join("disk"),
            iso: root.join("iso"),
            screenshots: root.join("screenshots"),
            run: root.join("run"),
            logs: root.join("logs"),
        }
    }

    /// The persisted run configuration.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("qemu.conf")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.toml")
    }

    /// Default monitor socket location.
    pub fn monitor_socket(&self) -> PathBuf {
        self.run.join("monitor.sock")
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.disk,
            &self.iso,
            &self.screenshots,
            &self.run,
            &self.logs,
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            debug!(path = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_run_dir(data: &Path) -> PathBuf {
    data.join("run")
}

#[cfg(not(target_os = "macos"))]
fn resolve_run_dir(data: &Path) -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join(APP_NAME),
        _ => data.join("run"),
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("state").join(APP_NAME)
    }
}
