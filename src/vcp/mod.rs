//! Volume Control Profile client building blocks.
//!
//! This module contains the per-device connection state machine, the
//! coordinated-set volume cache and the external output descriptor store
//! the orchestrator composes.

pub mod groups;
pub mod offsets;
pub mod protocol;
pub mod state_machine;
