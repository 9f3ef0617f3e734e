//! macemu: single-instance supervisor for a `qemu-system-ppc` Mac OS 9 guest.
//!
//! The crate builds the emulator invocation from a persisted configuration,
//! owns the emulator process, and drives it over the QEMU human monitor.
//! The `macemu` binary wraps it in an HTTP API and a command-line client.

pub mod context;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state_machine;
pub mod vm;
pub mod web;
