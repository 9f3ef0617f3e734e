//! Emulator command construction.
//!
//! Turns a [`Configuration`] into the ordered argument vector for
//! `qemu-system-ppc`. Arguments are kept as a structured `Vec<String>` and
//! handed to `tokio::process::Command::args` directly; nothing is ever joined
//! into a shell string.
//!
//! Drive index assignment decides the guest's boot order:
//!
//! ```text
//! primary disk   -> index 0
//! secondary disk -> next index
//! cdrom          -> last index (index 0 when no disk is present)
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::vm::config::{BootDevice, Configuration};

/// Audio device id shared by `-audiodev` and the machine option.
const AUDIO_DEV_ID: &str = "snd0";

/// Colour depth requested from the guest framebuffer.
const COLOR_DEPTH: u32 = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no bootable device: neither a disk nor a cdrom image exists")]
    NoBootableDevice,
}

/// Kind of media attached on a `-drive` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Media {
    Disk,
    Cdrom,
}

impl Media {
    fn as_str(self) -> &'static str {
        match self {
            Media::Disk => "disk",
            Media::Cdrom => "cdrom",
        }
    }
}

/// One attached drive, in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drive {
    pub index: u32,
    pub media: Media,
    pub path: PathBuf,
}

impl Drive {
    fn format(&self) -> &'static str {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("qcow2") => "qcow2",
            _ => "raw",
        }
    }

    fn spec(&self) -> String {
        format!(
            "file={},format={},media={},index={}",
            option_value(&self.path),
            self.format(),
            self.media.as_str(),
            self.index
        )
    }
}

/// A fully resolved emulator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmulatorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Device actually booted; differs from the configured one when the
    /// configured device is missing and the other kind is present.
    pub boot: BootDevice,
    pub drives: Vec<Drive>,
    /// Monitor socket the emulator is told to listen on.
    pub monitor_socket: PathBuf,
}

impl EmulatorCommand {
    /// Shell-like rendering for logs and `macemu args`. Not meant to be
    /// re-parsed.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(|c: char| c.is_whitespace() || c == '?' || c == '\'') {
                out.push('\'');
                out.push_str(&arg.replace('\'', r"'\''"));
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Static parts of the emulator invocation.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub emulator: PathBuf,
    /// Machine type passed to `-M`.
    pub machine: String,
    pub monitor_socket: PathBuf,
    /// Base directory for relative disk image paths.
    pub disk_dir: PathBuf,
    /// Base directory for relative ISO paths.
    pub iso_dir: PathBuf,
    /// Backend for `-audiodev` when sound is enabled.
    pub audio_backend: String,
}

impl CommandBuilder {
    /// Build the emulator command for `config`.
    ///
    /// `detected` is the host display resolution, if the caller probed it
    /// (see [`crate::vm::display::detect_resolution`]); the guest resolution is
    /// clamped to it per axis.
    pub fn build(
        &self,
        config: &Configuration,
        detected: Option<(u32, u32)>,
    ) -> Result<EmulatorCommand, BuildError> {
        let disks: Vec<PathBuf> = [&config.primary_disk, &config.secondary_disk]
            .into_iter()
            .flatten()
            .map(|p| resolve(&self.disk_dir, p))
            .filter(|p| p.is_file())
            .collect();
        let cdrom = config
            .cdrom
            .as_ref()
            .map(|p| resolve(&self.iso_dir, p))
            .filter(|p| p.is_file());

        let drives = assign_indices(disks, cdrom);
        let boot = effective_boot(config.boot_device, &drives)?;

        let (width, height) = match detected {
            Some((w, h)) if w > 0 && h > 0 => {
                (config.screen_width.min(w), config.screen_height.min(h))
            }
            _ => (config.screen_width, config.screen_height),
        };

        let mut machine = self.machine.clone();
        if config.sound_enabled {
            machine.push_str(&format!(",audiodev={AUDIO_DEV_ID}"));
        }

        let mut args: Vec<String> = vec![
            "-M".into(),
            machine,
            "-m".into(),
            config.memory_mb.to_string(),
            "-boot".into(),
            boot.code().into(),
            "-g".into(),
            format!("{width}x{height}x{COLOR_DEPTH}"),
        ];

        for drive in &drives {
            args.push("-drive".into());
            args.push(drive.spec());
        }

        args.push("-vnc".into());
        args.push(format!(":{}", config.display_index));

        args.push("-monitor".into());
        args.push(format!(
            "unix:{},server,nowait",
            option_value(&self.monitor_socket)
        ));

        if config.sound_enabled {
            args.push("-audiodev".into());
            args.push(format!("{},id={AUDIO_DEV_ID}", self.audio_backend));
        }

        args.push("-prom-env".into());
        args.push("auto-boot?=true".into());

        Ok(EmulatorCommand {
            program: self.emulator.clone(),
            args,
            boot,
            drives,
            monitor_socket: self.monitor_socket.clone(),
        })
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// A path as a QEMU option value: a literal `,` is written `,,`.
fn option_value(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

/// Disks first in configured order, cdrom last; indices are dense from 0.
fn assign_indices(disks: Vec<PathBuf>, cdrom: Option<PathBuf>) -> Vec<Drive> {
    let disks = disks.into_iter().map(|path| (Media::Disk, path));
    let cdrom = cdrom.into_iter().map(|path| (Media::Cdrom, path));
    disks
        .chain(cdrom)
        .zip(0u32..)
        .map(|((media, path), index)| Drive { index, media, path })
        .collect()
}

fn effective_boot(wanted: BootDevice, drives: &[Drive]) -> Result<BootDevice, BuildError> {
    let has = |m: Media| drives.iter().any(|d| d.media == m);
    match (wanted, has(Media::Disk), has(Media::Cdrom)) {
        (_, false, false) => Err(BuildError::NoBootableDevice),
        (BootDevice::Disk, true, _) | (BootDevice::Cdrom, _, true) => Ok(wanted),
        (BootDevice::Disk, false, true) => Ok(BootDevice::Cdrom),
        (BootDevice::Cdrom, true, false) => Ok(BootDevice::Disk),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        builder: CommandBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let disk_dir = tmp.path().join("disk");
            let iso_dir = tmp.path().join("iso");
            std::fs::create_dir_all(&disk_dir).unwrap();
            std::fs::create_dir_all(&iso_dir).unwrap();
            let builder = CommandBuilder {
                emulator: PathBuf::from("qemu-system-ppc"),
                machine: "mac99,via=pmu".into(),
                monitor_socket: tmp.path().join("monitor.sock"),
                disk_dir,
                iso_dir,
                audio_backend: "pa".into(),
            };
            Self { _tmp: tmp, builder }
        }

        fn disk(&self, name: &str) -> PathBuf {
            let p = self.builder.disk_dir.join(name);
            std::fs::write(&p, b"").unwrap();
            p
        }

        fn iso(&self, name: &str) -> PathBuf {
            let p = self.builder.iso_dir.join(name);
            std::fs::write(&p, b"").unwrap();
            p
        }
    }

    fn drive_args(cmd: &EmulatorCommand) -> Vec<&str> {
        cmd.args
            .windows(2)
            .filter(|w| w[0] == "-drive")
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn disk_and_cdrom_get_ascending_indices() {
        let fx = Fixture::new();
        let disk = fx.disk("os9.qcow2");
        let iso = fx.iso("install.iso");
        let config = Configuration {
            boot_device: BootDevice::Disk,
            primary_disk: Some("os9.qcow2".into()),
            cdrom: Some("install.iso".into()),
            ..Configuration::default()
        };

        let cmd = fx.builder.build(&config, None).unwrap();

        assert_eq!(
            drive_args(&cmd),
            vec![
                format!("file={},format=qcow2,media=disk,index=0", disk.display()),
                format!("file={},format=raw,media=cdrom,index=1", iso.display()),
            ]
        );
    }

    #[test]
    fn lone_cdrom_takes_index_zero() {
        let fx = Fixture::new();
        fx.iso("install.iso");
        let config = Configuration {
            primary_disk: Some("missing.qcow2".into()),
            cdrom: Some("install.iso".into()),
            ..Configuration::default()
        };

        let cmd = fx.builder.build(&config, None).unwrap();

        assert_eq!(cmd.drives.len(), 1);
        assert_eq!(cmd.drives[0].media, Media::Cdrom);
        assert_eq!(cmd.drives[0].index, 0);
    }

    #[test]
    fn secondary_disk_sits_between_primary_and_cdrom() {
        let fx = Fixture::new();
        fx.disk("a.qcow2");
        fx.disk("b.img");
        fx.iso("c.iso");
        let config = Configuration {
            primary_disk: Some("a.qcow2".into()),
            secondary_disk: Some("b.img".into()),
            cdrom: Some("c.iso".into()),
            ..Configuration::default()
        };

        let cmd = fx.builder.build(&config, None).unwrap();
        let kinds: Vec<_> = cmd.drives.iter().map(|d| (d.index, d.media)).collect();
        assert_eq!(
            kinds,
            vec![(0, Media::Disk), (1, Media::Disk), (2, Media::Cdrom)]
        );
        assert!(drive_args(&cmd)[1].contains("format=raw,media=disk,index=1"));
    }

    #[test]
    fn no_existing_images_is_an_error() {
        let fx = Fixture::new();
        let config = Configuration::default();
        assert_eq!(
            fx.builder.build(&config, None),
            Err(BuildError::NoBootableDevice)
        );
    }

    #[test]
    fn build_is_deterministic() {
        let fx = Fixture::new();
        fx.disk("macos9.qcow2");
        fx.iso("macos_921_ppc.iso");
        let config = Configuration {
            sound_enabled: true,
            ..Configuration::default()
        };

        let a = fx.builder.build(&config, Some((1280, 800))).unwrap();
        let b = fx.builder.build(&config, Some((1280, 800))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn boot_falls_back_to_present_device() {
        let fx = Fixture::new();
        fx.iso("macos_921_ppc.iso");
        let config = Configuration {
            boot_device: BootDevice::Disk,
            ..Configuration::default()
        };
        let cmd = fx.builder.build(&config, None).unwrap();
        assert_eq!(cmd.boot, BootDevice::Cdrom);
        let boot_pos = cmd.args.iter().position(|a| a == "-boot").unwrap();
        assert_eq!(cmd.args[boot_pos + 1], "d");
    }

    #[test]
    fn sound_adds_audiodev_and_machine_option() {
        let fx = Fixture::new();
        fx.iso("macos_921_ppc.iso");
        let config = Configuration {
            sound_enabled: true,
            ..Configuration::default()
        };
        let cmd = fx.builder.build(&config, None).unwrap();
        assert_eq!(cmd.args[1], "mac99,via=pmu,audiodev=snd0");
        assert!(cmd.args.windows(2).any(|w| w[0] == "-audiodev" && w[1] == "pa,id=snd0"));
    }

    #[test]
    fn resolution_is_clamped_to_detected_display() {
        let fx = Fixture::new();
        fx.iso("macos_921_ppc.iso");
        let config = Configuration {
            screen_width: 1600,
            screen_height: 1200,
            ..Configuration::default()
        };
        let cmd = fx.builder.build(&config, Some((1280, 1024))).unwrap();
        assert!(cmd.args.windows(2).any(|w| w[0] == "-g" && w[1] == "1280x1024x32"));

        let cmd = fx.builder.build(&config, None).unwrap();
        assert!(cmd.args.windows(2).any(|w| w[0] == "-g" && w[1] == "1600x1200x32"));
    }

    #[test]
    fn monitor_and_vnc_flags_present() {
        let fx = Fixture::new();
        fx.iso("macos_921_ppc.iso");
        let config = Configuration {
            display_index: 3,
            ..Configuration::default()
        };
        let cmd = fx.builder.build(&config, None).unwrap();
        let monitor = format!("unix:{},server,nowait", fx.builder.monitor_socket.display());
        assert!(cmd.args.windows(2).any(|w| w[0] == "-monitor" && w[1] == monitor));
        assert!(cmd.args.windows(2).any(|w| w[0] == "-vnc" && w[1] == ":3"));
    }

    #[test]
    fn commas_in_paths_are_doubled() {
        let mut fx = Fixture::new();
        let disk = fx.disk("os9,work.qcow2");
        fx.builder.monitor_socket = fx.builder.disk_dir.join("mon,1.sock");
        let config = Configuration {
            boot_device: BootDevice::Disk,
            primary_disk: Some("os9,work.qcow2".into()),
            ..Configuration::default()
        };

        let cmd = fx.builder.build(&config, None).unwrap();

        let escaped = disk.display().to_string().replace(',', ",,");
        assert_eq!(
            drive_args(&cmd),
            vec![format!("file={escaped},format=qcow2,media=disk,index=0")]
        );
        assert!(drive_args(&cmd)[0].contains("os9,,work.qcow2,format"));
        let monitor_pos = cmd.args.iter().position(|a| a == "-monitor").unwrap();
        assert!(cmd.args[monitor_pos + 1].contains("mon,,1.sock,server,nowait"));
        assert_eq!(cmd.drives[0].path, disk, "typed drive keeps the real path");
    }

    #[test]
    fn display_quotes_awkward_arguments() {
        let cmd = EmulatorCommand {
            program: PathBuf::from("qemu-system-ppc"),
            args: vec!["-prom-env".into(), "auto-boot?=true".into(), "-m".into(), "512".into()],
            boot: BootDevice::Cdrom,
            drives: Vec::new(),
            monitor_socket: PathBuf::from("/tmp/m.sock"),
        };
        assert_eq!(cmd.display(), "qemu-system-ppc -prom-env 'auto-boot?=true' -m 512");
    }
}
