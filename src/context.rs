//! Process-wide supervisor context.
//!
//! One [`SupervisorContext`] is built at startup and shared (behind an `Arc`)
//! by the web API and the CLI. It owns the directory layout, the settings, the
//! configuration store, the [`ProcessSupervisor`] and the restart-policy task.
//! [`SupervisorContext::shutdown`] stops the task and the emulator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::paths::MacemuPaths;
use crate::settings::{RestartKind, RestartSettings, Settings};
use crate::state_machine::instance_sm::InstanceState;
use crate::vm::command::{BuildError, CommandBuilder, EmulatorCommand};
use crate::vm::config::{ConfigStore, Configuration};
use crate::vm::display::detect_resolution;
use crate::vm::images::ImageLibrary;
use crate::vm::lifecycle::{InstanceHandle, LaunchError, ProcessSupervisor, TerminateError};
use crate::vm::screenshot::Screenshotter;
use crate::vm::status::{StatusQuery, StatusReport};

// ---------------------------------------------------------------------------
// Restart policy
// ---------------------------------------------------------------------------

/// What to do when an instance crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    /// Relaunch with the crashed instance's command, at most `max_restarts`
    /// times in a row, waiting `backoff` first.
    OnCrash { max_restarts: u32, backoff: Duration },
}

impl From<&RestartSettings> for RestartPolicy {
    fn from(s: &RestartSettings) -> Self {
        match s.policy {
            RestartKind::Never => RestartPolicy::Never,
            RestartKind::OnCrash => RestartPolicy::OnCrash {
                max_restarts: s.max_restarts,
                backoff: Duration::from_millis(s.backoff_ms),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct SupervisorContext {
    pub paths: MacemuPaths,
    pub settings: Settings,
    pub store: ConfigStore,
    pub supervisor: Arc<ProcessSupervisor>,
    pub builder: CommandBuilder,
    pub images: ImageLibrary,
    pub screenshots: Screenshotter,
    restart_task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorContext {
    pub fn new(paths: MacemuPaths, settings: Settings) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(settings.supervisor_options(&paths)));
        Self {
            store: ConfigStore::new(paths.config_file()),
            builder: settings.command_builder(&paths),
            images: ImageLibrary::new(&paths.disk, &paths.iso),
            screenshots: Screenshotter::new(
                &paths.screenshots,
                settings.screenshot.converter.clone(),
                Duration::from_millis(settings.screenshot.wait_ms),
            ),
            supervisor,
            paths,
            settings,
            restart_task: Mutex::new(None),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::from(&self.settings.supervisor.restart)
    }

    /// Spawn the restart-policy task. No-op for [`RestartPolicy::Never`] or
    /// when already running. Must be called inside a tokio runtime.
    pub fn start_restart_policy(&self) {
        let RestartPolicy::OnCrash {
            max_restarts,
            backoff,
        } = self.restart_policy()
        else {
            return;
        };

        let mut slot = self.restart_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        info!(max_restarts, ?backoff, "restart policy enabled");
        *slot = Some(tokio::spawn(restart_on_crash(
            Arc::clone(&self.supervisor),
            max_restarts,
            backoff,
        )));
    }

    pub fn status(&self) -> StatusReport {
        StatusQuery::new(&self.store, &self.supervisor).get_status()
    }

    /// Load the saved configuration and turn it into an emulator command.
    pub fn build_command(&self) -> Result<(EmulatorCommand, Configuration), BuildError> {
        let config = self.store.load().config;
        let detected = if self.settings.emulator.detect_display {
            detect_resolution()
        } else {
            None
        };
        let command = self.builder.build(&config, detected)?;
        Ok((command, config))
    }

    /// Launch an instance from the saved configuration.
    pub async fn start_instance(&self) -> Result<InstanceHandle, StartError> {
        let (command, config) = self.build_command()?;
        if command.boot != config.boot_device {
            warn!(
                configured = config.boot_device.code(),
                effective = command.boot.code(),
                "configured boot device missing, booting from the other"
            );
        }
        debug!(command = %command.display(), "launching emulator");
        Ok(self.supervisor.launch(command, config).await?)
    }

    /// Graceful stop; a forced kill after an ignored `quit` still counts as
    /// stopped.
    pub async fn stop_instance(&self) -> Result<InstanceHandle, TerminateError> {
        match self.supervisor.terminate(true).await {
            Err(TerminateError::EscalatedToKill { generation }) => {
                warn!(generation, "stop needed a forced kill");
                self.supervisor
                    .status()
                    .ok_or(TerminateError::NotRunning)
            }
            other => other,
        }
    }

    /// Stop whatever runs, then launch from the current configuration.
    pub async fn restart_instance(&self) -> Result<InstanceHandle, StartError> {
        match self.stop_instance().await {
            Ok(_) | Err(TerminateError::NotRunning) => {}
            Err(e) => warn!(error = %e, "stop before restart failed"),
        }
        self.start_instance().await
    }

    /// Stop the restart task and the emulator.
    pub async fn shutdown(&self) {
        let task = self
            .restart_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.supervisor.shutdown().await;
        info!("supervisor context shut down");
    }
}

/// Watch the supervisor and relaunch crashed instances.
async fn restart_on_crash(supervisor: Arc<ProcessSupervisor>, max_restarts: u32, backoff: Duration) {
    let mut rx = supervisor.subscribe();
    let mut handled: Option<u64> = None;

    while rx.changed().await.is_ok() {
        let crashed = rx
            .borrow_and_update()
            .clone()
            .filter(|h| h.state == InstanceState::Crashed);
        let Some(handle) = crashed else {
            continue;
        };
        if handled == Some(handle.generation) {
            continue;
        }
        handled = Some(handle.generation);

        if handle.restarts >= max_restarts {
            warn!(
                generation = handle.generation,
                restarts = handle.restarts,
                "restart limit reached, leaving instance crashed"
            );
            continue;
        }

        tokio::time::sleep(backoff).await;
        match supervisor.relaunch(&handle).await {
            Ok(new) => info!(
                crashed = handle.generation,
                generation = new.generation,
                restarts = new.restarts,
                "crashed instance relaunched"
            ),
            Err(LaunchError::AlreadyRunning { generation, .. }) => {
                debug!(generation, "instance already relaunched by a caller");
            }
            Err(e) => warn!(crashed = handle.generation, error = %e, "relaunch failed"),
        }
    }
}
