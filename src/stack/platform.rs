//! Platform collaborators queried by the core.
//!
//! Bonding/policy storage, coordinated-set membership and the platform
//! audio subsystem are owned elsewhere; the core only sees these traits.

use bluer::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vcp::protocol::GroupId;

/// Bond state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BondState {
   None,
   Bonding,
   Bonded,
   Unknown,
}

/// Stored connection policy of a remote device.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ConnectionPolicy {
   Unknown = -1,
   Forbidden = 0,
   Allowed = 100,
}

impl ConnectionPolicy {
   /// Maps a raw policy value from the policy store; unrecognised values map
   /// to `None`.
   pub fn from_raw(raw: i32) -> Option<Self> {
      Self::from_repr(raw)
   }
}

/// Platform audio stream that mirrors the group volume.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamType {
   #[default]
   Music,
   VoiceCall,
   Ring,
   Notification,
   Alarm,
}

/// Who initiated a volume change forwarded to the audio system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum VolumeOrigin {
   /// The platform (or this core on its behalf) commanded the change.
   Local,
   /// The remote device changed its volume on its own; the audio system must
   /// not echo it back as a new outbound set.
   Remote,
}

/// Bond, policy and service discovery information about remote devices.
pub trait DeviceDirectory: Send + Sync {
   fn bond_state(&self, device: Address) -> BondState;

   /// `None` when the stored policy value is not one the core understands.
   fn connection_policy(&self, device: Address) -> Option<ConnectionPolicy>;

   fn service_uuids(&self, device: Address) -> Vec<Uuid>;
}

/// Coordinated-set membership lookups.
///
/// Membership may resolve after a device connects; the owner of this trait
/// reports late resolutions through `VolumeControl::on_group_membership_resolved`.
pub trait GroupDirectory: Send + Sync {
   fn group_id(&self, device: Address) -> Option<GroupId>;
}

/// Platform audio subsystem owning the human-audible volume scale.
pub trait AudioSystem: Send + Sync {
   fn set_stream_volume(&self, stream: StreamType, index: i32, origin: VolumeOrigin);

   fn set_stream_mute(&self, stream: StreamType, muted: bool, origin: VolumeOrigin);

   /// Inclusive `(min, max)` index range of `stream`.
   fn stream_index_range(&self, stream: StreamType) -> (i32, i32);
}
