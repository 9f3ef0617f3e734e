//! Emulator management.
//!
//! Leaves first: [`config`] (persisted run configuration), [`command`]
//! (configuration to argument vector), [`monitor`] (QEMU human monitor
//! transport), [`lifecycle`] (process supervision), [`status`] (read-only
//! projection). The rest support the web API: screenshots, the disk/ISO
//! library, USB passthrough and the host display probe.

pub mod command;
pub mod config;
pub mod display;
pub mod images;
pub mod lifecycle;
pub mod monitor;
pub mod screenshot;
pub mod status;
pub mod usb;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use command::{BuildError, CommandBuilder, EmulatorCommand};
pub use config::{ConfigError, ConfigStore, Configuration};
pub use lifecycle::{InstanceHandle, LaunchError, ProcessSupervisor, TerminateError};
pub use monitor::{ChannelError, ControlChannel, ControlCommand};
pub use status::{StatusQuery, StatusReport};
