//! Recording collaborators for unit tests.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use bluer::Address;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
   stack::{
      native::NativeStack,
      platform::{
         AudioSystem, BondState, ConnectionPolicy, DeviceDirectory, GroupDirectory, StreamType,
         VolumeOrigin,
      },
   },
   vcp::protocol::{GroupId, VOLUME_CONTROL_SERVICE_UUID},
};

pub fn addr(last: u8) -> Address {
   Address::new([0x00, 0x1b, 0xdc, 0x00, 0x00, last])
}

pub fn init_logging() {
   let _ = env_logger::builder().is_test(true).try_init();
}

/// Outbound native command as recorded by [`MockStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
   Connect(Address),
   Disconnect(Address),
   SetVolume(Address, u8),
   SetGroupVolume(GroupId, u8),
   Mute(Address),
   Unmute(Address),
   MuteGroup(GroupId),
   UnmuteGroup(GroupId),
   SetOffset(Address, u8, i16),
}

#[derive(Default)]
pub struct MockStack {
   commands: Mutex<Vec<Command>>,
}

impl MockStack {
   pub fn take(&self) -> Vec<Command> {
      std::mem::take(&mut *self.commands.lock())
   }

   fn record(&self, command: Command) {
      self.commands.lock().push(command);
   }
}

impl NativeStack for MockStack {
   fn connect(&self, device: Address) {
      self.record(Command::Connect(device));
   }

   fn disconnect(&self, device: Address) {
      self.record(Command::Disconnect(device));
   }

   fn set_volume(&self, device: Address, volume: u8) {
      self.record(Command::SetVolume(device, volume));
   }

   fn set_group_volume(&self, group: GroupId, volume: u8) {
      self.record(Command::SetGroupVolume(group, volume));
   }

   fn mute(&self, device: Address) {
      self.record(Command::Mute(device));
   }

   fn unmute(&self, device: Address) {
      self.record(Command::Unmute(device));
   }

   fn mute_group(&self, group: GroupId) {
      self.record(Command::MuteGroup(group));
   }

   fn unmute_group(&self, group: GroupId) {
      self.record(Command::UnmuteGroup(group));
   }

   fn set_ext_output_offset(&self, device: Address, output_id: u8, offset: i16) {
      self.record(Command::SetOffset(device, output_id, offset));
   }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
   pub bond: BondState,
   pub policy: Option<ConnectionPolicy>,
   pub uuids: Vec<Uuid>,
}

impl Default for DeviceRecord {
   fn default() -> Self {
      Self {
         bond: BondState::Bonded,
         policy: Some(ConnectionPolicy::Allowed),
         uuids: vec![VOLUME_CONTROL_SERVICE_UUID],
      }
   }
}

/// Directory where unknown devices are unbonded with no services.
#[derive(Default)]
pub struct MockDirectory {
   devices: Mutex<HashMap<Address, DeviceRecord>>,
}

impl MockDirectory {
   pub fn insert(&self, device: Address, record: DeviceRecord) {
      self.devices.lock().insert(device, record);
   }

   /// Registers a bonded, allowed device advertising the VCS.
   pub fn allow(&self, device: Address) {
      self.insert(device, DeviceRecord::default());
   }

   pub fn set_bond(&self, device: Address, bond: BondState) {
      self.devices.lock().entry(device).or_default().bond = bond;
   }

   pub fn set_policy(&self, device: Address, policy: Option<ConnectionPolicy>) {
      self.devices.lock().entry(device).or_default().policy = policy;
   }
}

impl DeviceDirectory for MockDirectory {
   fn bond_state(&self, device: Address) -> BondState {
      self
         .devices
         .lock()
         .get(&device)
         .map_or(BondState::None, |r| r.bond)
   }

   fn connection_policy(&self, device: Address) -> Option<ConnectionPolicy> {
      self
         .devices
         .lock()
         .get(&device)
         .map_or(Some(ConnectionPolicy::Unknown), |r| r.policy)
   }

   fn service_uuids(&self, device: Address) -> Vec<Uuid> {
      self
         .devices
         .lock()
         .get(&device)
         .map(|r| r.uuids.clone())
         .unwrap_or_default()
   }
}

#[derive(Default)]
pub struct MockGroups {
   members: Mutex<HashMap<Address, GroupId>>,
}

impl MockGroups {
   pub fn assign(&self, device: Address, group: GroupId) {
      self.members.lock().insert(device, group);
   }
}

impl GroupDirectory for MockGroups {
   fn group_id(&self, device: Address) -> Option<GroupId> {
      self.members.lock().get(&device).copied()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCall {
   Volume(StreamType, i32, VolumeOrigin),
   Mute(StreamType, bool, VolumeOrigin),
}

pub struct MockAudio {
   range: (i32, i32),
   calls: Mutex<Vec<AudioCall>>,
   streams: Mutex<HashSet<StreamType>>,
}

impl MockAudio {
   pub fn with_range(min: i32, max: i32) -> Self {
      Self {
         range: (min, max),
         calls: Mutex::new(Vec::new()),
         streams: Mutex::new(HashSet::new()),
      }
   }

   pub fn take(&self) -> Vec<AudioCall> {
      std::mem::take(&mut *self.calls.lock())
   }

   /// Streams whose range was queried.
   pub fn queried(&self) -> HashSet<StreamType> {
      self.streams.lock().clone()
   }
}

impl AudioSystem for MockAudio {
   fn set_stream_volume(&self, stream: StreamType, index: i32, origin: VolumeOrigin) {
      self.calls.lock().push(AudioCall::Volume(stream, index, origin));
   }

   fn set_stream_mute(&self, stream: StreamType, muted: bool, origin: VolumeOrigin) {
      self.calls.lock().push(AudioCall::Mute(stream, muted, origin));
   }

   fn stream_index_range(&self, stream: StreamType) -> (i32, i32) {
      self.streams.lock().insert(stream);
      self.range
   }
}

/// Every collaborator the orchestrator needs, kept for assertions.
pub struct Harness {
   pub stack: Arc<MockStack>,
   pub directory: Arc<MockDirectory>,
   pub groups: Arc<MockGroups>,
   pub audio: Arc<MockAudio>,
}

impl Harness {
   pub fn new() -> Self {
      init_logging();
      Self {
         stack: Arc::new(MockStack::default()),
         directory: Arc::new(MockDirectory::default()),
         groups: Arc::new(MockGroups::default()),
         audio: Arc::new(MockAudio::with_range(0, 15)),
      }
   }
}
