//! External output (VOCS) descriptors per device.
//!
//! A device announces how many external outputs it exposes; those outputs
//! are addressed by ids `1..=n` from then on. Every accessor answers `None`
//! or `false` for an unknown (device, id) pair since stack events may
//! reference outputs that have not been announced yet.

use std::{
   collections::{BTreeMap, HashMap},
   sync::Arc,
};

use bluer::Address;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use smol_str::SmolStr;

/// Descriptor of a single external output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalOutput {
   pub offset: i16,
   pub location: u32,
   pub description: Option<SmolStr>,
}

#[derive(Debug, Default)]
struct DeviceOutputs {
   outputs: BTreeMap<u8, ExternalOutput>,
   /// Offsets requested while the device was not connected.
   pending: BTreeMap<u8, i16>,
}

/// Per-device store of external output descriptors.
#[derive(Default)]
pub struct OffsetDescriptorStore {
   devices: RwLock<HashMap<Address, Arc<Mutex<DeviceOutputs>>>>,
}

impl OffsetDescriptorStore {
   pub fn new() -> Self {
      Self::default()
   }

   fn entry(&self, device: Address) -> Option<Arc<Mutex<DeviceOutputs>>> {
      self.devices.read().get(&device).cloned()
   }

   fn entry_or_default(&self, device: Address) -> Arc<Mutex<DeviceOutputs>> {
      if let Some(entry) = self.entry(device) {
         return entry;
      }
      self.devices.write().entry(device).or_default().clone()
   }

   fn with_output<T>(
      &self,
      device: Address,
      id: u8,
      f: impl FnOnce(&mut ExternalOutput) -> T,
   ) -> Option<T> {
      let entry = self.entry(device)?;
      let mut outputs = entry.lock();
      outputs.outputs.get_mut(&id).map(f)
   }

   /// Replaces the device's outputs with `count` fresh entries numbered from 1.
   ///
   /// A count of zero forgets the device.
   pub fn init(&self, device: Address, count: u8) {
      if count == 0 {
         self.remove_device(device);
         return;
      }
      let entry = self.entry_or_default(device);
      let mut outputs = entry.lock();
      outputs.outputs = (1..=count).map(|id| (id, ExternalOutput::default())).collect();
      outputs.pending.retain(|id, _| *id <= count);
   }

   pub fn is_valid(&self, device: Address, id: u8) -> bool {
      self.with_output(device, id, |_| ()).is_some()
   }

   /// Number of outputs known for `device`.
   pub fn size(&self, device: Address) -> usize {
      self
         .entry(device)
         .map_or(0, |entry| entry.lock().outputs.len())
   }

   pub fn set_value(&self, device: Address, id: u8, offset: i16) -> bool {
      self
         .with_output(device, id, |output| output.offset = offset)
         .is_some()
   }

   pub fn value(&self, device: Address, id: u8) -> Option<i16> {
      self.with_output(device, id, |output| output.offset)
   }

   pub fn set_location(&self, device: Address, id: u8, location: u32) -> bool {
      self
         .with_output(device, id, |output| output.location = location)
         .is_some()
   }

   pub fn location(&self, device: Address, id: u8) -> Option<u32> {
      self.with_output(device, id, |output| output.location)
   }

   pub fn set_description(&self, device: Address, id: u8, description: SmolStr) -> bool {
      self
         .with_output(device, id, |output| output.description = Some(description))
         .is_some()
   }

   pub fn description(&self, device: Address, id: u8) -> Option<SmolStr> {
      self
         .with_output(device, id, |output| output.description.clone())
         .flatten()
   }

   pub fn output(&self, device: Address, id: u8) -> Option<ExternalOutput> {
      self.with_output(device, id, |output| output.clone())
   }

   /// Adds a single output id; fails if it already exists or is zero.
   pub fn add(&self, device: Address, id: u8) -> bool {
      if id == 0 {
         return false;
      }
      let entry = self.entry_or_default(device);
      let mut outputs = entry.lock();
      if outputs.outputs.contains_key(&id) {
         return false;
      }
      outputs.outputs.insert(id, ExternalOutput::default());
      true
   }

   pub fn remove(&self, device: Address, id: u8) -> bool {
      let Some(entry) = self.entry(device) else {
         return false;
      };
      let mut outputs = entry.lock();
      outputs.pending.remove(&id);
      outputs.outputs.remove(&id).is_some()
   }

   /// Drops every output of `device` but keeps it known.
   pub fn clear(&self, device: Address) -> bool {
      let Some(entry) = self.entry(device) else {
         return false;
      };
      let mut outputs = entry.lock();
      outputs.outputs.clear();
      outputs.pending.clear();
      true
   }

   pub fn remove_device(&self, device: Address) -> bool {
      self.devices.write().remove(&device).is_some()
   }

   pub fn clear_all(&self) {
      self.devices.write().clear();
   }

   /// Queues an offset for a device that is not connected yet.
   pub fn set_pending(&self, device: Address, id: u8, offset: i16) -> bool {
      let Some(entry) = self.entry(device) else {
         return false;
      };
      let mut outputs = entry.lock();
      if !outputs.outputs.contains_key(&id) {
         return false;
      }
      outputs.pending.insert(id, offset);
      true
   }

   /// Takes the queued offsets of `device`, dropping ids no longer known.
   pub fn take_pending(&self, device: Address) -> Vec<(u8, i16)> {
      let Some(entry) = self.entry(device) else {
         return Vec::new();
      };
      let mut outputs = entry.lock();
      let pending = std::mem::take(&mut outputs.pending);
      pending
         .into_iter()
         .filter(|(id, _)| outputs.outputs.contains_key(id))
         .collect()
   }

   pub fn to_json(&self, device: Address) -> serde_json::Value {
      let Some(entry) = self.entry(device) else {
         return json!([]);
      };
      let outputs = entry.lock();
      let list: Vec<_> = outputs
         .outputs
         .iter()
         .map(|(id, output)| {
            json!({
                "id": id,
                "offset": output.offset,
                "location": output.location,
                "description": output.description.as_deref(),
            })
         })
         .collect();
      json!(list)
   }
}
