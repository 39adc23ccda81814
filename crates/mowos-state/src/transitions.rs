//! The explicit transition table.
//!
//! Every allowed `(from, to)` pair is listed here; anything absent is
//! rejected — with one deliberate exception. A source state the current
//! firmware does not recognize (a legacy string recovered from an older
//! installation) is let through with a warning rather than trapping the
//! machine in a state it cannot leave.

use mowos_types::MowerState;

use MowerState::*;

/// Targets reachable from each recognized state. `ShuttingDown` is
/// terminal: present in the table with no outgoing transitions.
fn allowed_targets(from: &MowerState) -> Option<&'static [MowerState]> {
    match from {
        Starting => Some(&[Idle, Error]),
        Idle => Some(&[Active, Charging, Maintenance, EmergencyStop, ShuttingDown]),
        Active => Some(&[Idle, Navigating, Charging, EmergencyStop, Error]),
        // Navigating cannot dock directly: the machine has to settle into
        // Active or Idle before Charging is reachable.
        Navigating => Some(&[Active, Idle, EmergencyStop, Error]),
        Charging => Some(&[Idle, Active, EmergencyStop]),
        Error => Some(&[Idle, Maintenance, EmergencyStop]),
        EmergencyStop => Some(&[Idle, Error, ShuttingDown]),
        Maintenance => Some(&[Idle, Error]),
        ShuttingDown => Some(&[]),
        Unknown(_) => None,
    }
}

/// Outcome of checking a requested transition against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// The pair is in the table (or the state is unchanged).
    Allowed,
    /// The source is recognized and the pair is not in the table.
    Rejected,
    /// The source is a legacy state we cannot validate; permitted with a
    /// warning by the caller.
    UnknownSource,
}

/// Check whether `from -> to` may proceed.
///
/// A no-op "transition" to the current state is always allowed — it is a
/// field refresh, not a state change.
pub fn transition_allowed(from: &MowerState, to: &MowerState) -> TransitionCheck {
    if from == to {
        return TransitionCheck::Allowed;
    }
    match allowed_targets(from) {
        Some(targets) if targets.contains(to) => TransitionCheck::Allowed,
        Some(_) => TransitionCheck::Rejected,
        None => TransitionCheck::UnknownSource,
    }
}

// ── tests ────────────────────────────────────────────────────────────
