//! Emulator instance lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Starting ──EndpointReady──► Live (superstate)
//!    │                          ├── Running ──PauseAcked──► Paused
//!    │                          └── Paused  ──ResumeAcked─► Running
//!    │                        StopRequested ─► Stopping ──Exited──► Stopped
//!    │                        Exited(ok)     ─► Stopped
//!    │                        Exited(fail)   ─► Crashed
//!    └──LaunchAborted / Exited──► Crashed
//! ```
//!
//! `Stopped` and `Crashed` are terminal: they absorb every event.

use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the instance state machine.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// The monitor socket accepted a connection.
    EndpointReady,
    /// Startup was abandoned (readiness timeout); the process has been killed.
    LaunchAborted,
    /// A stop was requested by a caller.
    StopRequested,
    /// The monitor acknowledged `stop`.
    PauseAcked,
    /// The monitor acknowledged `cont`.
    ResumeAcked,
    /// The OS process exited. `success` is a zero exit status.
    Exited { success: bool },
}

/// Public projection of the machine's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Crashed,
}

impl InstanceState {
    /// `Stopped` and `Crashed` end an instance's life.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Crashed)
    }

    /// States in which the monitor is expected to answer.
    pub fn accepts_commands(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Paused)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the instance state machine.
///
/// Only identifies the instance for log lines; the process handle itself is
/// owned by the exit watcher.
#[derive(Debug, Default)]
pub struct InstanceMachine {
    pub generation: u64,
}

impl InstanceMachine {
    pub fn new(generation: u64) -> Self {
        Self { generation }
    }

    /// Project a machine state onto [`InstanceState`].
    pub fn phase(state: &State) -> InstanceState {
        match state {
            State::Starting { .. } => InstanceState::Starting,
            State::Running { .. } => InstanceState::Running,
            State::Paused { .. } => InstanceState::Paused,
            State::Stopping { .. } => InstanceState::Stopping,
            State::Stopped { .. } => InstanceState::Stopped,
            State::Crashed { .. } => InstanceState::Crashed,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::starting()",
    state(derive(Debug, Clone, PartialEq))
)]
impl InstanceMachine {
    /// Process spawned, monitor not yet connectable.
    #[state]
    fn starting(&mut self, event: &InstanceEvent) -> Outcome<State> {
        match event {
            InstanceEvent::EndpointReady => Transition(State::running()),
            InstanceEvent::LaunchAborted | InstanceEvent::Exited { .. } => {
                Transition(State::crashed())
            }
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: Live (parent of Running and Paused)
    // ------------------------------------------------------------------

    #[superstate]
    fn live(&mut self, event: &InstanceEvent) -> Outcome<State> {
        match event {
            InstanceEvent::StopRequested => Transition(State::stopping()),
            InstanceEvent::Exited { success: true } => Transition(State::stopped()),
            InstanceEvent::Exited { success: false } => Transition(State::crashed()),
            _ => Handled,
        }
    }

    #[state(superstate = "live")]
    fn running(&mut self, event: &InstanceEvent) -> Outcome<State> {
        match event {
            InstanceEvent::PauseAcked => Transition(State::paused()),
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn paused(&mut self, event: &InstanceEvent) -> Outcome<State> {
        match event {
            InstanceEvent::ResumeAcked => Transition(State::running()),
            _ => Super,
        }
    }

    /// Stop requested; any exit now counts as a clean stop.
    #[state]
    fn stopping(&mut self, event: &InstanceEvent) -> Outcome<State> {
        match event {
            InstanceEvent::Exited { .. } => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state(entry_action = "enter_stopped")]
    fn stopped(&mut self, event: &InstanceEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state(entry_action = "enter_crashed")]
    fn crashed(&mut self, event: &InstanceEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_stopped(&mut self) {
        info!(target: "instance", generation = self.generation, "instance stopped");
    }

    #[action]
    fn enter_crashed(&mut self) {
        warn!(target: "instance", generation = self.generation, "instance crashed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine<InstanceMachine> {
        InstanceMachine::new(1).state_machine()
    }

    fn phase(sm: &StateMachine<InstanceMachine>) -> InstanceState {
        InstanceMachine::phase(sm.state())
    }

    #[test]
    fn starts_in_starting() {
        let sm = machine();
        assert_eq!(phase(&sm), InstanceState::Starting);
    }

    #[test]
    fn ready_then_clean_exit_stops() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::EndpointReady);
        assert_eq!(phase(&sm), InstanceState::Running);
        sm.handle(&InstanceEvent::Exited { success: true });
        assert_eq!(phase(&sm), InstanceState::Stopped);
    }

    #[test]
    fn failed_exit_while_live_crashes() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::EndpointReady);
        sm.handle(&InstanceEvent::PauseAcked);
        assert_eq!(phase(&sm), InstanceState::Paused);
        sm.handle(&InstanceEvent::Exited { success: false });
        assert_eq!(phase(&sm), InstanceState::Crashed);
    }

    #[test]
    fn pause_resume_cycle() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::EndpointReady);
        sm.handle(&InstanceEvent::PauseAcked);
        sm.handle(&InstanceEvent::ResumeAcked);
        assert_eq!(phase(&sm), InstanceState::Running);
    }

    #[test]
    fn any_exit_after_stop_request_is_clean() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::EndpointReady);
        sm.handle(&InstanceEvent::StopRequested);
        assert_eq!(phase(&sm), InstanceState::Stopping);
        sm.handle(&InstanceEvent::Exited { success: false });
        assert_eq!(phase(&sm), InstanceState::Stopped);
    }

    #[test]
    fn aborted_launch_crashes() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::LaunchAborted);
        assert_eq!(phase(&sm), InstanceState::Crashed);
    }

    #[test]
    fn terminal_states_absorb_events() {
        let mut sm = machine();
        sm.handle(&InstanceEvent::EndpointReady);
        sm.handle(&InstanceEvent::Exited { success: true });
        sm.handle(&InstanceEvent::ResumeAcked);
        sm.handle(&InstanceEvent::EndpointReady);
        assert_eq!(phase(&sm), InstanceState::Stopped);
        assert!(phase(&sm).is_terminal());
    }
}
