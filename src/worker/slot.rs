//! Worker slot state machine.

use serde::{Deserialize, Serialize};

/// State of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for work.
    Idle,
    /// Holds a lease, handler not yet started.
    Claimed,
    /// Handler is running.
    Executing,
    /// Slot has exited.
    Stopped,
}

impl SlotState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SlotState) -> bool {
        use SlotState::*;

        matches!(
            (self, target),
            (Idle, Claimed) | (Idle, Stopped) |
            (Claimed, Executing) | (Claimed, Idle) |
            (Executing, Idle)
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Claimed | Self::Executing)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claimed => "claimed",
            Self::Executing => "executing",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Current state of every slot in a pool.
#[derive(Debug)]
pub(crate) struct SlotBoard {
    states: std::sync::Mutex<Vec<SlotState>>,
}

impl SlotBoard {
    pub fn new(size: usize) -> Self {
        Self {
            states: std::sync::Mutex::new(vec![SlotState::Idle; size]),
        }
    }

    pub fn set(&self, slot: usize, to: SlotState) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = states.get_mut(slot) {
            if !current.can_transition_to(to) {
                tracing::warn!(slot, from = %current, to = %to, "Unexpected slot transition");
            }
            *current = to;
        }
    }

    pub fn snapshot(&self) -> Vec<SlotState> {
        self.states.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
