//! Collaborator boundaries of the volume control core.
//!
//! This module defines the native stack command/event surface and the
//! platform services (bonding, coordinated sets, audio) the core consults.

pub mod native;
pub mod platform;
