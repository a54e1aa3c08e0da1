//! Volume control orchestrator.
//!
//! Owns the device -> state machine table, the group volume cache and the
//! external output store. Native stack events are routed to the matching
//! device actor and/or the caches; platform volume changes become native
//! commands; every observable change is fanned out to listeners.

use std::{
   collections::HashMap,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use futures::stream::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use smol_str::SmolStr;
use tokio::task::JoinHandle;

use crate::{
   config::Config,
   event::{EventSender, ListenerId, Listeners, VcpEvent},
   stack::{
      native::{NativeStack, StackEvent, VolumeTarget},
      platform::{
         AudioSystem, BondState, ConnectionPolicy, DeviceDirectory, GroupDirectory, VolumeOrigin,
      },
   },
   vcp::{
      groups::{GroupVolumeCache, VolumeReport},
      offsets::OffsetDescriptorStore,
      protocol::{
         ConnectionState, GroupId, VOLUME_CONTROL_SERVICE_UUID, audio_to_native, native_to_audio,
      },
      state_machine::{DeviceStateMachine, MachineContext},
   },
};

/// External services the orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
   pub stack: Arc<dyn NativeStack>,
   pub directory: Arc<dyn DeviceDirectory>,
   pub groups: Arc<dyn GroupDirectory>,
   pub audio: Arc<dyn AudioSystem>,
}

struct Inner {
   config: Config,
   stack: Arc<dyn NativeStack>,
   directory: Arc<dyn DeviceDirectory>,
   csip: Arc<dyn GroupDirectory>,
   audio: Arc<dyn AudioSystem>,

   // State
   devices: RwLock<HashMap<Address, Arc<DeviceStateMachine>>>,
   groups: GroupVolumeCache,
   offsets: OffsetDescriptorStore,
   listeners: Listeners,
   stopped: AtomicBool,
   this: Weak<Inner>,
}

/// Volume Control Profile client core.
///
/// Must be created and used inside a tokio runtime: each known device runs
/// as its own task. Dropping the service stops it.
pub struct VolumeControl {
   inner: Arc<Inner>,
   pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl VolumeControl {
   pub fn new(config: Config, collaborators: Collaborators) -> Self {
      let Collaborators {
         stack,
         directory,
         groups,
         audio,
      } = collaborators;
      let inner = Arc::new_cyclic(|this| Inner {
         config,
         stack,
         directory,
         csip: groups,
         audio,
         devices: RwLock::new(HashMap::new()),
         groups: GroupVolumeCache::new(),
         offsets: OffsetDescriptorStore::new(),
         listeners: Listeners::default(),
         stopped: AtomicBool::new(false),
         this: this.clone(),
      });
      info!("Volume control service started");
      Self {
         inner,
         pumps: Mutex::new(Vec::new()),
      }
   }

   pub fn register_listener(&self, listener: EventSender) -> ListenerId {
      self.inner.listeners.register(listener)
   }

   pub fn unregister_listener(&self, id: ListenerId) -> bool {
      self.inner.listeners.unregister(id)
   }

   /// Policy gate: bonded, and a connection policy other than forbidden.
   pub fn ok_to_connect(&self, device: Address) -> bool {
      self.inner.ok_to_connect(device)
   }

   /// Requests a connection. Returns `false` when the device does not
   /// advertise the Volume Control service or fails the policy gate; no
   /// state machine is created in that case.
   pub fn connect(&self, device: Address) -> bool {
      let inner = &self.inner;
      if inner.is_stopped() {
         return false;
      }
      if !inner
         .directory
         .service_uuids(device)
         .contains(&VOLUME_CONTROL_SERVICE_UUID)
      {
         warn!("{device}: cannot connect, Volume Control service not advertised");
         return false;
      }
      if !inner.ok_to_connect(device) {
         warn!("{device}: cannot connect, rejected by policy");
         return false;
      }
      inner
         .machine_or_spawn(device)
         .is_some_and(|machine| machine.connect().is_ok())
   }

   /// Requests a disconnection of a known device.
   pub fn disconnect(&self, device: Address) -> bool {
      match self.inner.machine(device) {
         Some(machine) => machine.disconnect().is_ok(),
         None => {
            debug!("{device}: disconnect requested for unknown device");
            false
         },
      }
   }

   /// Routes an event from the native stack.
   pub fn handle_stack_event(&self, event: StackEvent) {
      self.inner.handle_stack_event(event);
   }

   /// Feeds every event of `events` into [`Self::handle_stack_event`] from a
   /// background task.
   pub fn attach<S>(&self, events: S)
   where
      S: Stream<Item = StackEvent> + Send + 'static,
   {
      let weak = Arc::downgrade(&self.inner);
      let handle = tokio::spawn(async move {
         let mut events = Box::pin(events);
         while let Some(event) = events.next().await {
            let Some(inner) = weak.upgrade() else {
               break;
            };
            inner.handle_stack_event(event);
         }
         debug!("Stack event stream ended");
      });
      self.pumps.lock().push(handle);
   }

   /// Sets the volume of a group and records it for members joining later.
   pub fn set_group_volume(&self, group: GroupId, volume: u8) {
      let inner = &self.inner;
      if inner.is_stopped() {
         return;
      }
      inner.groups.set_volume(group, volume, &*inner.stack, &|device| {
         inner.is_connected(device)
      });
      inner.notify_group(group);
   }

   pub fn get_group_volume(&self, group: GroupId) -> Option<u8> {
      self.inner.groups.volume(group)
   }

   pub fn get_group_mute(&self, group: GroupId) -> Option<bool> {
      self.inner.groups.mute(group)
   }

   pub fn mute_group(&self, group: GroupId) {
      self.set_group_mute(group, true);
   }

   pub fn unmute_group(&self, group: GroupId) {
      self.set_group_mute(group, false);
   }

   fn set_group_mute(&self, group: GroupId, mute: bool) {
      let inner = &self.inner;
      if inner.is_stopped() {
         return;
      }
      inner.groups.set_mute(group, mute, &*inner.stack);
      inner.notify_group(group);
   }

   /// A volume change the device initiated itself.
   pub fn on_autonomous_volume_changed(&self, group: GroupId, volume: u8, mute: bool) {
      self
         .inner
         .on_volume_state(VolumeTarget::Group(group), volume, mute, true);
   }

   /// Late coordinated-set membership resolution for `device`.
   pub fn on_group_membership_resolved(&self, group: GroupId, device: Address) {
      let inner = &self.inner;
      if inner.is_stopped() {
         return;
      }
      inner
         .groups
         .resolve_member(group, device, &*inner.stack, &|device| {
            inner.is_connected(device)
         });
   }

   /// Platform audio index change on the configured stream for `group`.
   pub fn on_platform_volume_changed(&self, group: GroupId, index: i32) {
      let (_, max) = self
         .inner
         .audio
         .stream_index_range(self.inner.config.audio_stream);
      let volume = audio_to_native(index, max);
      debug!("{group}: platform index {index}/{max} -> volume {volume}");
      self.set_group_volume(group, volume);
   }

   /// Commands a single connected device, outside of any group.
   pub fn set_device_volume(&self, device: Address, volume: u8) -> bool {
      self.command_connected(device, |stack| stack.set_volume(device, volume))
   }

   pub fn mute(&self, device: Address) -> bool {
      self.command_connected(device, |stack| stack.mute(device))
   }

   pub fn unmute(&self, device: Address) -> bool {
      self.command_connected(device, |stack| stack.unmute(device))
   }

   fn command_connected(&self, device: Address, f: impl FnOnce(&dyn NativeStack)) -> bool {
      if self.inner.is_stopped() || !self.inner.is_connected(device) {
         return false;
      }
      f(&*self.inner.stack);
      true
   }

   /// Sets the offset of an external output. The command is sent right away
   /// to a connected device and queued until the next connection otherwise.
   pub fn set_volume_offset(&self, device: Address, output_id: u8, offset: i16) -> bool {
      let inner = &self.inner;
      if inner.is_stopped() || !inner.offsets.is_valid(device, output_id) {
         return false;
      }
      if inner.is_connected(device) {
         inner.stack.set_ext_output_offset(device, output_id, offset);
         true
      } else {
         inner.queue_offset(device, output_id, offset)
      }
   }

   pub fn volume_offset(&self, device: Address, output_id: u8) -> Option<i16> {
      self.inner.offsets.value(device, output_id)
   }

   pub fn output_location(&self, device: Address, output_id: u8) -> Option<u32> {
      self.inner.offsets.location(device, output_id)
   }

   pub fn output_description(&self, device: Address, output_id: u8) -> Option<SmolStr> {
      self.inner.offsets.description(device, output_id)
   }

   pub fn output_count(&self, device: Address) -> usize {
      self.inner.offsets.size(device)
   }

   /// Drops a disconnected device's state once it is unbonded.
   pub fn on_bond_state_changed(&self, device: Address, bond: BondState) {
      if bond != BondState::None {
         return;
      }
      let disconnected = self
         .inner
         .machine(device)
         .is_some_and(|machine| machine.state() == ConnectionState::Disconnected);
      if disconnected {
         self.inner.remove_device(device);
      }
   }

   /// Connection state after every previously routed event for `device` has
   /// been processed. Unknown devices are `Disconnected`.
   pub async fn connection_state(&self, device: Address) -> ConnectionState {
      let Some(machine) = self.inner.machine(device) else {
         return ConnectionState::Disconnected;
      };
      machine.query_state().await.unwrap_or_default()
   }

   pub fn connected_devices(&self) -> Vec<Address> {
      self
         .inner
         .devices
         .read()
         .values()
         .filter(|machine| machine.state() == ConnectionState::Connected)
         .map(|machine| machine.device())
         .collect()
   }

   /// Every device with a state machine, with its last known state.
   pub fn devices(&self) -> Vec<(Address, ConnectionState)> {
      self
         .inner
         .devices
         .read()
         .values()
         .map(|machine| (machine.device(), machine.state()))
         .collect()
   }

   /// Snapshot of devices, groups and external outputs.
   pub fn dump(&self) -> serde_json::Value {
      let inner = &self.inner;
      let mut devices = self.devices();
      devices.sort_by_key(|(addr, _)| addr.to_string());
      let devices: Vec<_> = devices
         .into_iter()
         .map(|(addr, state)| {
            json!({
                "address": addr.to_string(),
                "state": state.to_str(),
                "group": inner.csip.group_id(addr).map(|g| g.0),
                "outputs": inner.offsets.to_json(addr),
            })
         })
         .collect();
      json!({
          "devices": devices,
          "groups": inner.groups.to_json(),
      })
   }

   /// Discards every state machine without further notifications.
   pub fn stop(&self) {
      let inner = &self.inner;
      if inner.stopped.swap(true, Ordering::AcqRel) {
         return;
      }
      info!("Stopping volume control service");
      inner.listeners.silence();
      for handle in self.pumps.lock().drain(..) {
         handle.abort();
      }
      let machines: Vec<_> = inner.devices.write().drain().collect();
      for (_, machine) in machines {
         machine.abort();
      }
      inner.groups.clear();
      inner.offsets.clear_all();
   }
}

impl Drop for VolumeControl {
   fn drop(&mut self) {
      self.stop();
   }
}

impl Inner {
   fn is_stopped(&self) -> bool {
      self.stopped.load(Ordering::Acquire)
   }

   fn ok_to_connect(&self, device: Address) -> bool {
      let bond = self.directory.bond_state(device);
      if bond != BondState::Bonded {
         debug!("{device}: not bonded ({bond})");
         return false;
      }
      match self.directory.connection_policy(device) {
         Some(ConnectionPolicy::Allowed | ConnectionPolicy::Unknown) => true,
         Some(ConnectionPolicy::Forbidden) => false,
         None => {
            warn!("{device}: unrecognised connection policy");
            false
         },
      }
   }

   fn machine(&self, device: Address) -> Option<Arc<DeviceStateMachine>> {
      self.devices.read().get(&device).cloned()
   }

   /// Get-or-create on the device table.
   fn machine_or_spawn(&self, device: Address) -> Option<Arc<DeviceStateMachine>> {
      if self.is_stopped() {
         return None;
      }
      if let Some(machine) = self.machine(device) {
         return Some(machine);
      }
      let mut devices = self.devices.write();
      let machine = devices.entry(device).or_insert_with(|| {
         info!("{device}: creating state machine");
         let context: Weak<dyn MachineContext> = self.this.clone();
         Arc::new(DeviceStateMachine::spawn(
            device,
            self.config.connection_timeout(),
            self.config.device_queue_depth,
            self.stack.clone(),
            context,
         ))
      });
      Some(machine.clone())
   }

   fn is_connected(&self, device: Address) -> bool {
      self
         .devices
         .read()
         .get(&device)
         .is_some_and(|machine| machine.state() == ConnectionState::Connected)
   }

   fn remove_device(&self, device: Address) {
      if self.devices.write().remove(&device).is_none() {
         return;
      }
      info!("{device}: removing state machine");
      self.offsets.remove_device(device);
      self.groups.forget_member(device);
   }

   fn handle_stack_event(&self, event: StackEvent) {
      if self.is_stopped() {
         debug!("Dropping stack event after stop: {event:?}");
         return;
      }
      match event {
         StackEvent::ConnectionStateChanged { device, state } => {
            self.on_connection_event(device, state);
         },
         StackEvent::VolumeStateChanged {
            target,
            volume,
            mute,
            autonomous,
         } => {
            self.on_volume_state(target, volume, mute, autonomous);
         },
         StackEvent::DeviceAvailable {
            device,
            external_outputs,
         } => {
            info!("{device}: available with {external_outputs} external output(s)");
            self.offsets.init(device, external_outputs);
         },
         StackEvent::ExtOutputVolumeOffsetChanged {
            device,
            output_id,
            offset,
         } => {
            if self.offsets.set_value(device, output_id, offset) {
               self.listeners.emit(VcpEvent::VolumeOffsetChanged {
                  device,
                  output_id,
                  offset,
               });
            } else {
               warn!("{device}: offset for unknown output {output_id}");
            }
         },
         StackEvent::ExtOutputLocationChanged {
            device,
            output_id,
            location,
         } => {
            if self.offsets.set_location(device, output_id, location) {
               self.listeners.emit(VcpEvent::LocationChanged {
                  device,
                  output_id,
                  location,
               });
            } else {
               warn!("{device}: location for unknown output {output_id}");
            }
         },
         StackEvent::ExtOutputDescriptionChanged {
            device,
            output_id,
            description,
         } => {
            if self
               .offsets
               .set_description(device, output_id, description.clone())
            {
               self.listeners.emit(VcpEvent::DescriptionChanged {
                  device,
                  output_id,
                  description,
               });
            } else {
               warn!("{device}: description for unknown output {output_id}");
            }
         },
      }
   }

   fn on_connection_event(&self, device: Address, state: ConnectionState) {
      let machine = match self.machine(device) {
         Some(machine) => machine,
         None => match state {
            ConnectionState::Connecting | ConnectionState::Connected
               if self.ok_to_connect(device) =>
            {
               let Some(machine) = self.machine_or_spawn(device) else {
                  return;
               };
               machine
            },
            _ => {
               debug!("{device}: ignoring {state} for unknown device");
               return;
            },
         },
      };
      if let Err(e) = machine.stack_event(state) {
         warn!("{device}: dropped connection event: {e}");
      }
   }

   fn on_volume_state(&self, target: VolumeTarget, volume: u8, mute: bool, autonomous: bool) {
      if self.is_stopped() {
         return;
      }
      let (group, reporter) = match target {
         VolumeTarget::Group(group) => (Some(group), None),
         VolumeTarget::Device(device) => (
            self
               .csip
               .group_id(device)
               .or_else(|| self.groups.group_of(device)),
            Some(device),
         ),
      };

      let Some(group) = group else {
         // Volume-independent device.
         if autonomous {
            self.forward_to_audio(volume, mute, None);
         }
         self.listeners.emit(VcpEvent::VolumeChanged {
            target,
            volume,
            mute,
         });
         return;
      };

      let report = VolumeReport {
         volume,
         mute,
         autonomous,
         reporter,
      };
      let previous = self.groups.apply_report(group, report, &*self.stack);
      if autonomous {
         self.forward_to_audio(volume, mute, previous.mute);
      }
      self.listeners.emit(VcpEvent::VolumeChanged {
         target: VolumeTarget::Group(group),
         volume,
         mute,
      });
   }

   /// Mirrors a device-originated change on the platform stream.
   fn forward_to_audio(&self, volume: u8, mute: bool, previous_mute: Option<bool>) {
      let stream = self.config.audio_stream;
      let (min, max) = self.audio.stream_index_range(stream);
      let index = native_to_audio(volume, max).max(min);
      debug!("Forwarding volume {volume} to {stream} index {index}");
      self
         .audio
         .set_stream_volume(stream, index, VolumeOrigin::Remote);
      if previous_mute != Some(mute) {
         self.audio.set_stream_mute(stream, mute, VolumeOrigin::Remote);
      }
   }

   fn notify_group(&self, group: GroupId) {
      if let Some(entry) = self.groups.get(group)
         && let Some(volume) = entry.volume
      {
         self.listeners.emit(VcpEvent::VolumeChanged {
            target: VolumeTarget::Group(group),
            volume,
            mute: entry.mute.unwrap_or(false),
         });
      }
   }

   fn on_connected(&self, device: Address) {
      let group = self
         .csip
         .group_id(device)
         .or_else(|| self.groups.group_of(device));
      if let Some(group) = group {
         self.groups.sync_connected_member(group, device, &*self.stack);
      }
      self.flush_pending_offsets(device);
   }

   fn queue_offset(&self, device: Address, output_id: u8, offset: i16) -> bool {
      debug!("{device}: queueing offset {offset} for output {output_id}");
      if !self.offsets.set_pending(device, output_id, offset) {
         return false;
      }
      // The device may have connected, and drained the queue, since the
      // caller checked.
      if self.is_connected(device) {
         self.flush_pending_offsets(device);
      }
      true
   }

   fn flush_pending_offsets(&self, device: Address) {
      for (output_id, offset) in self.offsets.take_pending(device) {
         debug!("{device}: applying queued offset {offset} to output {output_id}");
         self.stack.set_ext_output_offset(device, output_id, offset);
      }
   }
}

impl MachineContext for Inner {
   fn ok_to_connect(&self, device: Address) -> bool {
      Inner::ok_to_connect(self, device)
   }

   fn connection_state_changed(
      &self,
      device: Address,
      previous: ConnectionState,
      state: ConnectionState,
   ) {
      if self.is_stopped() {
         return;
      }
      match state {
         ConnectionState::Connected => self.on_connected(device),
         ConnectionState::Disconnected
            if self.directory.bond_state(device) == BondState::None =>
         {
            self.remove_device(device);
         },
         _ => {},
      }
      self.listeners.emit(VcpEvent::ConnectionStateChanged {
         device,
         state,
         previous,
      });
   }
}
