//! Read-only status projection.
//!
//! Combines the saved configuration with the supervisor's latest instance
//! snapshot. Never opens the monitor socket, so it answers even while the
//! emulator is wedged.

use serde::Serialize;

use crate::vm::config::{ConfigStore, Configuration};
use crate::vm::lifecycle::{InstanceHandle, ProcessSupervisor};

/// What `GET /api/status` and `macemu status` report.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// An instance exists and has not stopped or crashed.
    pub running: bool,
    pub pid: Option<u32>,
    /// Latest instance, including a terminal one with its exit status.
    pub instance: Option<InstanceHandle>,
    /// The configuration as currently saved.
    pub config: Configuration,
    /// Values in the config file that were replaced by defaults.
    pub config_warnings: Vec<String>,
    /// The saved configuration differs from what the live instance runs with.
    pub config_changed: bool,
}

pub struct StatusQuery<'a> {
    store: &'a ConfigStore,
    supervisor: &'a ProcessSupervisor,
}

impl<'a> StatusQuery<'a> {
    pub fn new(store: &'a ConfigStore, supervisor: &'a ProcessSupervisor) -> Self {
        Self { store, supervisor }
    }

    pub fn get_status(&self) -> StatusReport {
        let loaded = self.store.load();
        let instance = self.supervisor.status();

        let live = instance.as_ref().filter(|h| !h.state.is_terminal());
        let running = live.is_some();
        let pid = live.and_then(|h| h.pid);
        let config_changed = live.is_some_and(|h| h.launched_config != loaded.config);

        StatusReport {
            running,
            pid,
            instance,
            config: loaded.config,
            config_warnings: loaded.warnings.iter().map(ToString::to_string).collect(),
            config_changed,
        }
    }
}
