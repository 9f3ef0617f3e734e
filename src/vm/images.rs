//! Disk and CD-ROM image library.
//!
//! Disk images live in the disk directory (`*.qcow2`, `*.img`, `*.raw`), ISO
//! images in the ISO directory. Creation and resizing shell out to
//! `qemu-img`:
//!
//! ```text
//! qemu-img create -f qcow2 <disk_dir>/<name>.qcow2 <size>
//! qemu-img resize <disk_dir>/<name> <size>
//! qemu-img info --output=json <disk_dir>/<name>     (virtual size)
//! ```
//!
//! Names are plain file names; anything that could step outside the library
//! directories is rejected.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::vm::config::Configuration;

const DISK_EXTENSIONS: [&str; 3] = ["qcow2", "img", "raw"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DiskImage {
    pub name: String,
    pub path: PathBuf,
    /// Bytes used on the host.
    pub actual_size: u64,
    /// Guest-visible capacity, when `qemu-img` could tell.
    pub virtual_size: Option<u64>,
    pub actual_size_human: String,
    pub virtual_size_human: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IsoImage {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub size_human: String,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image name {0:?}")]
    InvalidName(String),

    #[error("invalid size {0:?} (expected e.g. 10G, 512M, +2G)")]
    InvalidSize(String),

    #[error("disk {0} already exists")]
    AlreadyExists(String),

    #[error("disk {0} not found")]
    NotFound(String),

    #[error("disk {0} is currently configured")]
    InUse(String),

    #[error("qemu-img failed: {0}")]
    Tool(String),

    #[error("image library i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// The two image directories plus the `qemu-img` binary.
#[derive(Debug, Clone)]
pub struct ImageLibrary {
    pub disk_dir: PathBuf,
    pub iso_dir: PathBuf,
    pub qemu_img: PathBuf,
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

impl ImageLibrary {
    pub fn new(disk_dir: impl Into<PathBuf>, iso_dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_dir: disk_dir.into(),
            iso_dir: iso_dir.into(),
            qemu_img: PathBuf::from("qemu-img"),
        }
    }

    /// Disk images sorted by name. A missing directory is an empty library.
    pub async fn list_disks(&self) -> Result<Vec<DiskImage>, ImageError> {
        let mut disks = Vec::new();
        for (name, path, actual_size) in scan(&self.disk_dir, &DISK_EXTENSIONS)? {
            let virtual_size = if has_extension(&path, "qcow2") {
                self.virtual_size(&path).await
            } else {
                Some(actual_size)
            };
            disks.push(DiskImage {
                name,
                path,
                actual_size,
                virtual_size,
                actual_size_human: format_size(actual_size),
                virtual_size_human: virtual_size.map(format_size),
            });
        }
        Ok(disks)
    }

    /// ISO images sorted by name.
    pub fn list_isos(&self) -> Result<Vec<IsoImage>, ImageError> {
        Ok(scan(&self.iso_dir, &["iso"])?
            .into_iter()
            .map(|(name, path, size)| IsoImage {
                name,
                path,
                size,
                size_human: format_size(size),
            })
            .collect())
    }

    /// Create an empty qcow2 image. Returns the sanitized file name.
    pub async fn create_disk(&self, name: &str, size: &str) -> Result<String, ImageError> {
        let name = sanitize_disk_name(name)?;
        check_size(size, false)?;

        let path = self.disk_dir.join(&name);
        if path.exists() {
            return Err(ImageError::AlreadyExists(name));
        }
        std::fs::create_dir_all(&self.disk_dir)?;

        self.run_qemu_img(&["create", "-f", "qcow2"], &path, size)
            .await?;
        info!(name = %name, size, "disk image created");
        Ok(name)
    }

    /// Delete a disk image that the configuration does not reference.
    pub fn delete_disk(&self, name: &str, config: &Configuration) -> Result<(), ImageError> {
        let path = self.existing_disk(name)?;
        if self.is_configured(&path, config) {
            return Err(ImageError::InUse(name.to_string()));
        }
        std::fs::remove_file(&path)?;
        info!(name, "disk image deleted");
        Ok(())
    }

    /// Grow (or with `qemu-img`'s consent, shrink) a disk image.
    pub async fn resize_disk(&self, name: &str, size: &str) -> Result<(), ImageError> {
        let path = self.existing_disk(name)?;
        check_size(size, true)?;
        self.run_qemu_img(&["resize"], &path, size).await?;
        info!(name, size, "disk image resized");
        Ok(())
    }

    fn existing_disk(&self, name: &str) -> Result<PathBuf, ImageError> {
        check_plain_name(name)?;
        let path = self.disk_dir.join(name);
        if !path.is_file() {
            return Err(ImageError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    fn is_configured(&self, path: &Path, config: &Configuration) -> bool {
        [&config.primary_disk, &config.secondary_disk]
            .into_iter()
            .flatten()
            .any(|configured| {
                let configured = if configured.is_absolute() {
                    configured.clone()
                } else {
                    self.disk_dir.join(configured)
                };
                configured == path
            })
    }

    async fn virtual_size(&self, path: &Path) -> Option<u64> {
        let output = Command::new(&self.qemu_img)
            .args(["info", "--output=json"])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            debug!(path = %path.display(), "qemu-img info failed");
            return None;
        }
        let info: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        info.get("virtual-size")?.as_u64()
    }

    async fn run_qemu_img(&self, args: &[&str], path: &Path, size: &str) -> Result<(), ImageError> {
        let output = Command::new(&self.qemu_img)
            .args(args)
            .arg(path)
            .arg(size)
            .output()
            .await
            .map_err(|e| ImageError::Tool(format!("spawn {}: {e}", self.qemu_img.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ImageError::Tool(format!(
                "exit {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// `(name, path, size)` of the regular files in `dir` with one of `extensions`.
fn scan(dir: &Path, extensions: &[&str]) -> Result<Vec<(String, PathBuf, u64)>, ImageError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !extensions.iter().any(|ext| has_extension(&path, ext)) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        found.push((name, path, meta.len()));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Keep `[A-Za-z0-9._-]`, then make sure the name ends in `.qcow2`.
pub fn sanitize_disk_name(name: &str) -> Result<String, ImageError> {
    let mut clean: String = name
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if !clean.ends_with(".qcow2") {
        clean.push_str(".qcow2");
    }
    check_plain_name(&clean)?;
    if clean == ".qcow2" || clean.starts_with('.') {
        return Err(ImageError::InvalidName(name.to_string()));
    }
    Ok(clean)
}

fn check_plain_name(name: &str) -> Result<(), ImageError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(ImageError::InvalidName(name.to_string()))
    }
}

/// `<digits>[KMGT]`, optionally with a leading `+`/`-` for resizes.
fn check_size(size: &str, relative_ok: bool) -> Result<(), ImageError> {
    let body = match size.strip_prefix(['+', '-']) {
        Some(rest) if relative_ok => rest,
        Some(_) => return Err(ImageError::InvalidSize(size.to_string())),
        None => size,
    };
    let digits = body.strip_suffix(['K', 'M', 'G', 'T']).unwrap_or(body);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ImageError::InvalidSize(size.to_string()))
    }
}

/// Human-readable size with one decimal, binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
