//! Emulator process supervision.
//!
//! One [`ProcessSupervisor`] owns at most one live emulator process at a time.
//!
//! ## Architecture
//!
//! ```text
//! launch(EmulatorCommand)
//!     └─► tokio::process::Command  →  qemu-system-ppc child
//!             ├─► readiness poll      (connect to the monitor socket)
//!             └─► exit watcher task   (owns the Child; awaits exit or a kill request)
//!                     └─► InstanceMachine (statig) → watch::Sender<Option<InstanceHandle>>
//! terminate(graceful)
//!     ├─► `quit` over the monitor, bounded wait
//!     └─► kill request to the watcher on timeout (escalation)
//! ```
//!
//! `launch` and `terminate` serialize on one async mutex. Status reads come
//! from the `watch` snapshot and never take that mutex.
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use statig::prelude::*;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::state_machine::instance_sm::{InstanceEvent, InstanceMachine, InstanceState};
use crate::vm::command::EmulatorCommand;
use crate::vm::config::Configuration;
use crate::vm::monitor::{ChannelError, ControlChannel, ControlCommand};

/// How long a forced kill may take before we give up on the process.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Interval between monitor readiness probes during launch.
const READY_POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Timeouts governing the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Bound on the wait for the monitor socket after spawning.
    pub launch_timeout: Duration,
    /// Bound on the wait for exit after a graceful `quit`.
    pub quit_timeout: Duration,
    /// Bound on one monitor round-trip.
    pub command_timeout: Duration,
    /// Monitor socket reported when no instance exists.
    pub monitor_socket: PathBuf,
}

/// How an emulator process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Snapshot of one supervised emulator instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHandle {
    /// Increases by one with every launch; identifies the instance.
    pub generation: u64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub control_endpoint: PathBuf,
    pub state: InstanceState,
    pub exit: Option<ExitInfo>,
    /// Policy restarts that led to this instance.
    pub restarts: u32,
    /// The configuration this instance was built from.
    pub launched_config: Configuration,
    #[serde(skip)]
    pub command: EmulatorCommand,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("an emulator instance is already {state} (generation {generation})")]
    AlreadyRunning {
        generation: u64,
        state: InstanceState,
    },

    #[error("monitor endpoint not ready within {0:?}; emulator killed")]
    EndpointTimeout(Duration),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("emulator exited during startup ({0})")]
    ExitedDuringStartup(ExitInfo),
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("no emulator instance is running")]
    NotRunning,

    /// The instance ignored `quit` and was killed. It is gone when this is
    /// returned.
    #[error("instance {generation} did not quit in time and was killed")]
    EscalatedToKill { generation: u64 },

    #[error("instance {generation} (pid {pid:?}) survived a forced kill")]
    KillFailed { generation: u64, pid: Option<u32> },
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The machine and watcher plumbing of the current (latest) instance.
struct Active {
    generation: u64,
    machine: StateMachine<InstanceMachine>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct Shared {
    active: Mutex<Option<Active>>,
    snapshot: watch::Sender<Option<InstanceHandle>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed `event` to the machine of instance `generation` and publish the
    /// resulting state. Events for replaced instances are dropped.
    fn transition(&self, generation: u64, event: InstanceEvent, exit: Option<ExitInfo>) {
        let mut guard = self.active();
        let Some(active) = guard.as_mut().filter(|a| a.generation == generation) else {
            debug!(generation, ?event, "dropping event for replaced instance");
            return;
        };

        let before = InstanceMachine::phase(active.machine.state());
        active.machine.handle(&event);
        let after = InstanceMachine::phase(active.machine.state());
        if after.is_terminal() {
            active.kill_tx = None;
        }

        self.snapshot.send_modify(|snap| {
            if let Some(handle) = snap.as_mut().filter(|h| h.generation == generation) {
                handle.state = after;
                if handle.exit.is_none() {
                    handle.exit = exit;
                }
            }
        });

        if before != after {
            debug!(generation, from = %before, to = %after, "instance state changed");
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owner of the single emulator process.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    options: SupervisorOptions,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                snapshot,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(0),
            options,
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Receive every published instance snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<InstanceHandle>> {
        self.shared.snapshot.subscribe()
    }

    /// Current instance, if any, with its liveness re-checked against the OS.
    pub fn status(&self) -> Option<InstanceHandle> {
        let mut handle = self.shared.snapshot.borrow().clone()?;
        if handle.state.is_terminal() {
            return Some(handle);
        }
        let Some(pid) = handle.pid else {
            return Some(handle);
        };
        if pid_alive(pid) {
            return Some(handle);
        }

        // The process is gone. A live watcher is about to record the exit;
        // a finished one never will.
        let watcher_lost = self
            .shared
            .active()
            .as_ref()
            .filter(|a| a.generation == handle.generation)
            .and_then(|a| a.watcher.as_ref())
            .is_none_or(|w| w.is_finished());
        if watcher_lost {
            warn!(generation = handle.generation, pid, "emulator vanished without an exit record");
            self.shared
                .transition(handle.generation, InstanceEvent::Exited { success: false }, None);
            return self.shared.snapshot.borrow().clone();
        }
        handle.state = if handle.state == InstanceState::Stopping {
            InstanceState::Stopped
        } else {
            InstanceState::Crashed
        };
        Some(handle)
    }

    /// Spawn the emulator and wait for its monitor to come up.
    pub async fn launch(
        &self,
        command: EmulatorCommand,
        config: Configuration,
    ) -> Result<InstanceHandle, LaunchError> {
        self.launch_with_restarts(command, config, 0).await
    }

    /// Launch again from a previous instance's command and configuration.
    /// Used by the restart policy.
    pub async fn relaunch(&self, previous: &InstanceHandle) -> Result<InstanceHandle, LaunchError> {
        self.launch_with_restarts(
            previous.command.clone(),
            previous.launched_config.clone(),
            previous.restarts + 1,
        )
        .await
    }

    async fn launch_with_restarts(
        &self,
        command: EmulatorCommand,
        config: Configuration,
        restarts: u32,
    ) -> Result<InstanceHandle, LaunchError> {
        let _guard = self.lifecycle.lock().await;

        if let Some(current) = self.status().filter(|h| !h.state.is_terminal()) {
            return Err(LaunchError::AlreadyRunning {
                generation: current.generation,
                state: current.state,
            });
        }

        prepare_socket_path(&command);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::SpawnFailed {
            program: command.program.clone(),
            source,
        })?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let handle = InstanceHandle {
            generation,
            pid,
            started_at: Utc::now(),
            control_endpoint: command.monitor_socket.clone(),
            state: InstanceState::Starting,
            exit: None,
            restarts,
            launched_config: config,
            command,
        };

        *self.shared.active() = Some(Active {
            generation,
            machine: InstanceMachine::new(generation).state_machine(),
            kill_tx: None,
            watcher: None,
        });
        self.shared.snapshot.send_replace(Some(handle.clone()));

        info!(
            generation,
            pid = ?pid,
            memory_mb = handle.launched_config.memory_mb,
            boot = handle.command.boot.code(),
            "emulator spawned"
        );

        self.wait_ready(generation, &mut child, &handle).await?;

        // Ready: mark Running first so an immediate exit is judged as a
        // live-instance exit by the watcher.
        self.shared
            .transition(generation, InstanceEvent::EndpointReady, None);

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(
            Arc::clone(&self.shared),
            generation,
            child,
            kill_rx,
        ));
        if let Some(active) = self.shared.active().as_mut() {
            if active.generation == generation {
                active.kill_tx = Some(kill_tx);
                active.watcher = Some(watcher);
            }
        }

        info!(generation, endpoint = %handle.control_endpoint.display(), "emulator ready");
        Ok(self.status().unwrap_or(handle))
    }

    /// Poll the monitor socket until it accepts a connection, the child exits,
    /// or the launch timeout elapses. Kills the child on timeout.
    async fn wait_ready(
        &self,
        generation: u64,
        child: &mut Child,
        handle: &InstanceHandle,
    ) -> Result<(), LaunchError> {
        let channel = ControlChannel::new(&handle.control_endpoint, self.options.command_timeout);
        let deadline = Instant::now() + self.options.launch_timeout;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let exit = ExitInfo::from(status);
                    warn!(generation, %exit, "emulator exited during startup");
                    self.shared.transition(
                        generation,
                        InstanceEvent::Exited { success: exit.success() },
                        Some(exit),
                    );
                    return Err(LaunchError::ExitedDuringStartup(exit));
                }
                Ok(None) => {}
                Err(e) => error!(generation, error = %e, "try_wait failed during startup"),
            }

            if channel.probe().await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    generation,
                    timeout = ?self.options.launch_timeout,
                    "monitor endpoint not ready, killing emulator"
                );
                if let Err(e) = child.kill().await {
                    error!(generation, error = %e, "failed to kill unready emulator");
                }
                let exit = child.wait().await.ok().map(ExitInfo::from);
                self.shared
                    .transition(generation, InstanceEvent::LaunchAborted, exit);
                return Err(LaunchError::EndpointTimeout(self.options.launch_timeout));
            }

            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Stop the live instance.
    ///
    /// Graceful: send `quit` and wait up to the quit timeout, then escalate to
    /// a forced kill (returned as [`TerminateError::EscalatedToKill`]).
    /// Not graceful: kill immediately.
    pub async fn terminate(&self, graceful: bool) -> Result<InstanceHandle, TerminateError> {
        let _guard = self.lifecycle.lock().await;

        let Some(handle) = self.status().filter(|h| !h.state.is_terminal()) else {
            return Err(TerminateError::NotRunning);
        };
        let generation = handle.generation;
        let mut rx = self.subscribe();

        self.shared
            .transition(generation, InstanceEvent::StopRequested, None);

        if graceful {
            let channel =
                ControlChannel::new(&handle.control_endpoint, self.options.command_timeout);
            match channel.send(&ControlCommand::Quit).await {
                Ok(_) => debug!(generation, "quit sent"),
                Err(e) => warn!(generation, error = %e, "quit over monitor failed"),
            }
            if wait_terminal(&mut rx, generation, self.options.quit_timeout).await {
                info!(generation, "emulator quit");
                return Ok(self.status().unwrap_or(handle));
            }
            warn!(
                generation,
                timeout = ?self.options.quit_timeout,
                "emulator ignored quit, escalating to kill"
            );
        }

        self.force_kill(&handle);

        if !wait_terminal(&mut rx, generation, KILL_GRACE).await {
            error!(generation, pid = ?handle.pid, "emulator survived kill");
            return Err(TerminateError::KillFailed {
                generation,
                pid: handle.pid,
            });
        }

        if graceful {
            Err(TerminateError::EscalatedToKill { generation })
        } else {
            info!(generation, "emulator killed");
            Ok(self.status().unwrap_or(handle))
        }
    }

    /// Ask the watcher to kill the child; fall back to a direct SIGKILL when
    /// no watcher is attached.
    fn force_kill(&self, handle: &InstanceHandle) {
        let kill_tx = self
            .shared
            .active()
            .as_mut()
            .filter(|a| a.generation == handle.generation)
            .and_then(|a| a.kill_tx.take());

        match kill_tx.map(|tx| tx.send(())) {
            Some(Ok(())) => {}
            _ => {
                if let Some(pid) = handle.pid.and_then(|p| i32::try_from(p).ok()) {
                    warn!(generation = handle.generation, pid, "no watcher, sending SIGKILL");
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                    }
                }
            }
        }
    }

    /// Send a command to the live instance.
    ///
    /// `expected_generation` pins the instance the caller observed; a
    /// replaced instance yields [`ChannelError::Stale`]. `Quit` is refused
    /// here: stopping goes through [`ProcessSupervisor::terminate`].
    pub async fn dispatch(
        &self,
        expected_generation: Option<u64>,
        command: ControlCommand,
    ) -> Result<String, ChannelError> {
        if command == ControlCommand::Quit {
            return Err(ChannelError::InvalidArgument(
                "quit is issued by terminate".to_string(),
            ));
        }

        let handle = self.status();
        let current = handle.as_ref().map(|h| h.generation);
        if let Some(expected) = expected_generation {
            if current != Some(expected) {
                return Err(ChannelError::Stale { expected, current });
            }
        }

        let handle = match handle {
            Some(h) if h.state.accepts_commands() => h,
            Some(h) => return Err(ChannelError::Unreachable(h.control_endpoint)),
            None => return Err(ChannelError::Unreachable(self.options.monitor_socket.clone())),
        };

        let channel = ControlChannel::new(&handle.control_endpoint, self.options.command_timeout);
        let reply = channel.send(&command).await?;

        match command {
            ControlCommand::Pause => {
                self.shared
                    .transition(handle.generation, InstanceEvent::PauseAcked, None)
            }
            ControlCommand::Resume => {
                self.shared
                    .transition(handle.generation, InstanceEvent::ResumeAcked, None)
            }
            _ => {}
        }

        info!(generation = handle.generation, command = command.name(), "monitor command acknowledged");
        Ok(reply)
    }

    /// Stop the live instance, if any, as part of process teardown.
    pub async fn shutdown(&self) {
        match self.terminate(true).await {
            Ok(_) | Err(TerminateError::NotRunning) => {}
            Err(e) => warn!(error = %e, "emulator shutdown was not clean"),
        }
    }
}

/// Remove a leftover socket from a previous run and make sure its directory
/// exists, so readiness is only signalled by the new process.
fn prepare_socket_path(command: &EmulatorCommand) {
    let socket = &command.monitor_socket;
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(path = %socket.display(), "removed stale monitor socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %socket.display(), error = %e, "cannot remove stale monitor socket"),
    }
    if let Some(parent) = socket.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "cannot create monitor socket directory");
        }
    }
}

/// Exit watcher: one per instance, ends when the child has been reaped.
async fn watch_exit(
    shared: Arc<Shared>,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            warn!(generation, pid = ?child.id(), "force-killing emulator");
            if let Err(e) = child.start_kill() {
                error!(generation, error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => Some(ExitInfo::from(status)),
        Err(e) => {
            error!(generation, error = %e, "wait on emulator failed");
            None
        }
    };
    match exit {
        Some(exit) if exit.success() => info!(generation, %exit, "emulator exited"),
        Some(exit) => warn!(generation, %exit, "emulator exited abnormally"),
        None => {}
    }

    let success = exit.is_some_and(|e| e.success());
    shared.transition(generation, InstanceEvent::Exited { success }, exit);
    debug!(generation, "exit watcher finished");
}

/// Wait until instance `generation` is terminal (or replaced), up to `bound`.
async fn wait_terminal(
    rx: &mut watch::Receiver<Option<InstanceHandle>>,
    generation: u64,
    bound: Duration,
) -> bool {
    let reached = tokio::time::timeout(
        bound,
        rx.wait_for(|snap| {
            snap.as_ref()
                .is_none_or(|h| h.generation != generation || h.state.is_terminal())
        }),
    )
    .await;
    matches!(reached, Ok(Ok(_)))
}

/// `kill(pid, 0)`: the process exists (zombies included) unless ESRCH.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let r = unsafe { libc::kill(pid, 0) };
    r == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
