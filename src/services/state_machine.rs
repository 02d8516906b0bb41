//! Presence state machine - pure transition function over gate occupancy
//!
//! Two states, no timers, no terminal state. The machine is deliberately
//! stateless: the effective state of a gate is derived from its ledger on
//! every call, so there is no shared mutable automaton to corrupt and replay
//! after a crash always reads the truth.
//!
//! Transition table:
//!
//! | Current | Event   | Next            |
//! |---------|---------|-----------------|
//! | NoTruck | Truck   | Truck           |
//! | NoTruck | NoTruck | NoTruck (no-op) |
//! | Truck   | NoTruck | NoTruck         |
//! | Truck   | Truck   | Truck (no-op)   |

use crate::domain::delivery::Delivery;
use crate::domain::event::PresenceStatus;

/// Gate occupancy state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    NoTruck,
    Truck,
}

impl PresenceState {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::NoTruck => "no-truck",
            PresenceState::Truck => "truck",
        }
    }
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply one presence signal to a state
///
/// Deterministic: the same (state, status) pair always yields the same next
/// state. Invalid signal values never reach this function - the engine
/// rejects them before the transition.
#[inline]
pub fn transition(current: PresenceState, status: PresenceStatus) -> PresenceState {
    match (current, status) {
        (PresenceState::NoTruck, PresenceStatus::Truck) => PresenceState::Truck,
        (PresenceState::NoTruck, PresenceStatus::NoTruck) => PresenceState::NoTruck,
        (PresenceState::Truck, PresenceStatus::NoTruck) => PresenceState::NoTruck,
        (PresenceState::Truck, PresenceStatus::Truck) => PresenceState::Truck,
    }
}

/// Derive the effective state of a gate from its most recent delivery
///
/// A gate is occupied exactly when its last delivery is still open; a gate
/// with no history is idle.
#[inline]
pub fn state_from_ledger(last: Option<&Delivery>) -> PresenceState {
    match last {
        Some(delivery) if delivery.is_open() => PresenceState::Truck,
        _ => PresenceState::NoTruck,
    }
}
