//! Guest screenshots.
//!
//! ```text
//! screendump screenshots/screen-<utc>.ppm   (monitor)
//!     └─► wait until the file is non-empty  (bounded)
//!         └─► <converter> < ppm > png       (external filter, e.g. pnmtopng)
//!             └─► screenshots/latest.png    (atomic replace)
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::vm::lifecycle::ProcessSupervisor;
use crate::vm::monitor::{ControlCommand, wait_for_file};

pub const LATEST_NAME: &str = "latest.png";

#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Screenshotter {
    dir: PathBuf,
    converter: Vec<String>,
    wait: Duration,
}

impl Screenshotter {
    pub fn new(dir: impl Into<PathBuf>, converter: Vec<String>, wait: Duration) -> Self {
        Self {
            dir: dir.into(),
            converter,
            wait,
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_NAME)
    }

    /// The most recent screenshot, if one was ever taken.
    pub fn latest(&self) -> Option<PathBuf> {
        let path = self.latest_path();
        path.is_file().then_some(path)
    }

    /// Dump the guest screen and convert it into `latest.png`.
    pub async fn capture(&self, supervisor: &ProcessSupervisor) -> Result<Screenshot> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;

        let taken_at = Utc::now();
        let dump = Screendump(
            self.dir
                .join(format!("screen-{}.ppm", taken_at.format("%Y%m%d-%H%M%S%.3f"))),
        );

        supervisor
            .dispatch(None, ControlCommand::Screendump(dump.0.clone()))
            .await
            .context("screendump")?;

        if !wait_for_file(&dump.0, self.wait).await {
            bail!(
                "emulator did not write {} within {:?}",
                dump.0.display(),
                self.wait
            );
        }

        let path = self.convert(&dump.0).await?;
        info!(path = %path.display(), "screenshot saved");
        Ok(Screenshot { path, taken_at })
    }

    /// Feed `ppm` through the converter and atomically replace `latest.png`.
    pub async fn convert(&self, ppm: &Path) -> Result<PathBuf> {
        let Some((program, args)) = self.converter.split_first() else {
            bail!("no screenshot converter configured");
        };

        let input = std::fs::File::open(ppm).with_context(|| format!("open {}", ppm.display()))?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawn converter {program}"))?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(program, status = %output.status, "screenshot conversion failed");
            bail!("{program} failed ({}): {}", output.status, stderr.trim());
        }

        let latest = self.latest_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&output.stdout)?;
        tmp.persist(&latest)
            .with_context(|| format!("replace {}", latest.display()))?;
        Ok(latest)
    }
}

/// Raw screendump; removed when capture finishes, successful or not.
struct Screendump(PathBuf);

impl Drop for Screendump {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.0.display(), error = %e, "could not remove screendump"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ppm(dir: &Path) -> PathBuf {
        let path = dir.join("screen.ppm");
        let mut ppm = b"P6\n1 1\n255\n".to_vec();
        ppm.extend_from_slice(&[255, 0, 0]);
        std::fs::write(&path, ppm).unwrap();
        path
    }

    #[tokio::test]
    async fn convert_replaces_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let shots = Screenshotter::new(tmp.path(), vec!["cat".into()], Duration::from_secs(1));
        assert!(shots.latest().is_none());

        let ppm = sample_ppm(tmp.path());
        let latest = shots.convert(&ppm).await.unwrap();

        assert_eq!(latest, tmp.path().join(LATEST_NAME));
        assert_eq!(std::fs::read(&latest).unwrap(), std::fs::read(&ppm).unwrap());
        assert_eq!(shots.latest(), Some(latest));
    }

    #[tokio::test]
    async fn failing_converter_keeps_previous_latest() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(LATEST_NAME), b"old").unwrap();
        let shots = Screenshotter::new(tmp.path(), vec!["false".into()], Duration::from_secs(1));

        let ppm = sample_ppm(tmp.path());
        assert!(shots.convert(&ppm).await.is_err());
        assert_eq!(std::fs::read(tmp.path().join(LATEST_NAME)).unwrap(), b"old");
    }

    #[tokio::test]
    async fn empty_converter_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let shots = Screenshotter::new(tmp.path(), Vec::new(), Duration::from_secs(1));
        let ppm = sample_ppm(tmp.path());
        assert!(shots.convert(&ppm).await.is_err());
    }
}
