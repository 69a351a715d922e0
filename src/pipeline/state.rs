//! Engine state management

use log::warn;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Engine state machine
///
/// Capture goes Idle → Running → Draining → Stopped. Playout passes through
/// Priming first, while it fills the device before starting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started
    Idle,

    /// Queueing the first frames on the device before output starts
    Priming,

    /// Moving frames every timing pulse
    Running {
        /// When the engine entered Running
        started_at: Instant,
    },

    /// Stop requested; finishing the in-flight transfer and stopping the stream
    Draining,

    /// Loop exited and cannot be restarted
    Stopped,
}

impl EngineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &EngineState) -> bool {
        use EngineState::*;

        match (self, target) {
            (Idle, Priming) => true,
            (Idle, Running { .. }) => true,
            (Idle, Stopped) => true, // never ran

            (Priming, Running { .. }) => true,
            (Priming, Draining) => true, // stopped before output started

            (Running { .. }, Draining) => true,

            (Draining, Stopped) => true,

            (Stopped, _) => false,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EngineState::Idle => "Idle",
            EngineState::Priming => "Priming",
            EngineState::Running { .. } => "Running",
            EngineState::Draining => "Draining",
            EngineState::Stopped => "Stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Running { .. })
    }

    /// Check if the engine is stopped or stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Draining)
    }

    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let EngineState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// State shared between an engine thread and whoever reports on it.
#[derive(Debug, Clone)]
pub struct StateCell {
    name: &'static str,
    state: Arc<RwLock<EngineState>>,
}

impl StateCell {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(RwLock::new(EngineState::Idle)),
        }
    }

    pub fn get(&self) -> EngineState {
        *self.state.read()
    }

    /// Move to `target` if the transition is valid. Returns whether it happened.
    pub fn transition(&self, target: EngineState) -> bool {
        let mut state = self.state.write();
        if state.can_transition_to(&target) {
            *state = target;
            true
        } else {
            warn!("{}: ignoring transition {} -> {}", self.name, *state, target);
            false
        }
    }

    pub fn set_running(&self) -> bool {
        self.transition(EngineState::Running {
            started_at: Instant::now(),
        })
    }
}
