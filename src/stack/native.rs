//! Native Bluetooth stack boundary.
//!
//! Outbound commands are fire-and-forget: the stack reports the outcome
//! later as a [`StackEvent`].

use std::fmt;

use bluer::Address;
use smol_str::SmolStr;

use crate::vcp::protocol::{ConnectionState, GroupId};

/// Addressee of a volume report or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeTarget {
   Device(Address),
   Group(GroupId),
}

impl fmt::Display for VolumeTarget {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Device(addr) => write!(f, "{addr}"),
         Self::Group(group) => write!(f, "{group}"),
      }
   }
}

/// Events delivered by the native stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
   ConnectionStateChanged {
      device: Address,
      state: ConnectionState,
   },
   VolumeStateChanged {
      target: VolumeTarget,
      volume: u8,
      mute: bool,
      autonomous: bool,
   },
   DeviceAvailable {
      device: Address,
      external_outputs: u8,
   },
   ExtOutputVolumeOffsetChanged {
      device: Address,
      output_id: u8,
      offset: i16,
   },
   ExtOutputLocationChanged {
      device: Address,
      output_id: u8,
      location: u32,
   },
   ExtOutputDescriptionChanged {
      device: Address,
      output_id: u8,
      description: SmolStr,
   },
}

impl StackEvent {
   /// Device the event is addressed to, if any.
   pub fn device(&self) -> Option<Address> {
      match self {
         Self::ConnectionStateChanged { device, .. }
         | Self::DeviceAvailable { device, .. }
         | Self::ExtOutputVolumeOffsetChanged { device, .. }
         | Self::ExtOutputLocationChanged { device, .. }
         | Self::ExtOutputDescriptionChanged { device, .. } => Some(*device),
         Self::VolumeStateChanged { target, .. } => match target {
            VolumeTarget::Device(device) => Some(*device),
            VolumeTarget::Group(_) => None,
         },
      }
   }
}

/// Commands issued to the native stack.
pub trait NativeStack: Send + Sync {
   fn connect(&self, device: Address);

   fn disconnect(&self, device: Address);

   fn set_volume(&self, device: Address, volume: u8);

   fn set_group_volume(&self, group: GroupId, volume: u8);

   fn mute(&self, device: Address);

   fn unmute(&self, device: Address);

   fn mute_group(&self, group: GroupId);

   fn unmute_group(&self, group: GroupId);

   fn set_ext_output_offset(&self, device: Address, output_id: u8, offset: i16);
}
