//! # mowos-state
//!
//! The operational state machine of the MowOS data core.
//!
//! Holds the single live [`mowos_types::OperationalState`], enforces an
//! explicit transition table, keeps a bounded audit ring of accepted
//! transitions, and survives process restarts: state is cache-written
//! synchronously on every accepted change, flushed to the durable store by
//! a background loop, and recovered cache-first at startup.
//!
//! Recovery never crashes the process — a corrupted or missing prior
//! session degrades to a safe `Error`/`Safety` state with diagnostics.

pub mod error;
pub mod machine;
pub mod transitions;

pub use error::{StateError, StateResult};
pub use machine::{StateMachine, StateMachineConfig, StateUpdate};
pub use transitions::{TransitionCheck, transition_allowed};
