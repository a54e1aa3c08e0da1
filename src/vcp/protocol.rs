//! Volume Control Profile definitions.
//!
//! Connection states, coordinated-set identifiers, the service UUID and the
//! linear rescale between the profile's native volume range and a platform
//! audio stream index.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Volume Control Service (0x1844).
pub const VOLUME_CONTROL_SERVICE_UUID: Uuid =
   Uuid::from_u128(0x00001844_0000_1000_8000_00805f9b34fb);

/// Upper bound of the profile's native volume setting.
pub const MAX_NATIVE_VOLUME: u8 = u8::MAX;

/// Profile connection state of a remote device.
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
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

impl ConnectionState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Coordinated-set group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u16);

impl fmt::Display for GroupId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "group#{}", self.0)
   }
}

/// `round(numerator / denominator)` with halves rounded up.
const fn div_round(numerator: u64, denominator: u64) -> u64 {
   (numerator + denominator / 2) / denominator
}

/// Converts a platform stream index to the native volume range.
///
/// `index` is clamped to `0..=audio_max`; a non-positive `audio_max` maps
/// everything to zero.
pub fn audio_to_native(index: i32, audio_max: i32) -> u8 {
   if audio_max <= 0 {
      return 0;
   }
   let index = index.clamp(0, audio_max) as u64;
   let native = div_round(index * MAX_NATIVE_VOLUME as u64, audio_max as u64);
   native.min(MAX_NATIVE_VOLUME as u64) as u8
}

/// Converts a native volume to a platform stream index in `0..=audio_max`.
pub fn native_to_audio(volume: u8, audio_max: i32) -> i32 {
   if audio_max <= 0 {
      return 0;
   }
   let index = div_round(volume as u64 * audio_max as u64, MAX_NATIVE_VOLUME as u64);
   index.min(audio_max as u64) as i32
}
