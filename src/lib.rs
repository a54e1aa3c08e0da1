//! Bluetooth LE Audio Volume Control Profile client core.
//!
//! [`VolumeControl`] keeps a connection state machine per remote renderer,
//! caches the volume of coordinated sets so late joiners can be brought in
//! line, mirrors device-originated changes on the platform audio stream and
//! tracks the offsets of each device's external outputs.
//!
//! The native Bluetooth stack, bonding/policy storage, set membership and the
//! audio subsystem are injected through the traits in [`stack`].

pub mod config;
pub mod error;
pub mod event;
pub mod service;
pub mod stack;
pub mod vcp;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Result, VcpError};
pub use event::{EventBus, EventQueue, EventSender, ListenerId, VcpEvent};
pub use service::{Collaborators, VolumeControl};
pub use stack::{
   native::{NativeStack, StackEvent, VolumeTarget},
   platform::{
      AudioSystem, BondState, ConnectionPolicy, DeviceDirectory, GroupDirectory, StreamType,
      VolumeOrigin,
   },
};
pub use vcp::protocol::{ConnectionState, GroupId};
