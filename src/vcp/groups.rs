//! Coordinated-set volume cache.
//!
//! Each group carries its last known (volume, mute) pair and the members the
//! core has seen. Every group sits behind its own mutex. Native commands are
//! decided under that mutex and issued after it is released, so a stack that
//! reports back synchronously can re-enter the cache.

use std::{
   collections::{BTreeSet, HashMap},
   sync::Arc,
};

use bluer::Address;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::{stack::native::NativeStack, vcp::protocol::GroupId};

/// Answers whether a device is currently `Connected`.
pub trait ConnectionLookup {
   fn is_connected(&self, device: Address) -> bool;
}

impl<F: Fn(Address) -> bool> ConnectionLookup for F {
   fn is_connected(&self, device: Address) -> bool {
      self(device)
   }
}

/// Cached state of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupEntry {
   /// Last commanded or reported volume; `None` until the group is first set.
   pub volume: Option<u8>,
   pub mute: Option<bool>,
   pub members: BTreeSet<Address>,
}

impl GroupEntry {
   fn state(&self) -> GroupState {
      GroupState {
         volume: self.volume,
         mute: self.mute,
      }
   }
}

/// (volume, mute) copied out of a locked entry.
#[derive(Debug, Clone, Copy)]
struct GroupState {
   volume: Option<u8>,
   mute: Option<bool>,
}

impl GroupState {
   /// Pushes the cached (volume, mute) to a single member.
   fn push_to(self, device: Address, stack: &dyn NativeStack) -> bool {
      if let Some(volume) = self.volume {
         stack.set_volume(device, volume);
      }
      match self.mute {
         Some(true) => stack.mute(device),
         Some(false) => stack.unmute(device),
         None => {},
      }
      self.volume.is_some() || self.mute.is_some()
   }
}

/// A volume report from the native stack, already resolved to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeReport {
   pub volume: u8,
   pub mute: bool,
   pub autonomous: bool,
   /// Member that reported the change, when the stack named one.
   pub reporter: Option<Address>,
}

/// Cache values replaced by a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Previous {
   pub volume: Option<u8>,
   pub mute: Option<bool>,
}

#[derive(Default)]
pub struct GroupVolumeCache {
   groups: RwLock<HashMap<GroupId, Arc<Mutex<GroupEntry>>>>,
}

impl GroupVolumeCache {
   pub fn new() -> Self {
      Self::default()
   }

   fn entry(&self, group: GroupId) -> Option<Arc<Mutex<GroupEntry>>> {
      self.groups.read().get(&group).cloned()
   }

   fn entry_or_default(&self, group: GroupId) -> Arc<Mutex<GroupEntry>> {
      if let Some(entry) = self.entry(group) {
         return entry;
      }
      self.groups.write().entry(group).or_default().clone()
   }

   /// Cached volume of `group`, `None` if it has never been set or reported.
   pub fn volume(&self, group: GroupId) -> Option<u8> {
      self.entry(group).and_then(|entry| entry.lock().volume)
   }

   pub fn mute(&self, group: GroupId) -> Option<bool> {
      self.entry(group).and_then(|entry| entry.lock().mute)
   }

   pub fn members(&self, group: GroupId) -> Vec<Address> {
      self
         .entry(group)
         .map(|entry| entry.lock().members.iter().copied().collect())
         .unwrap_or_default()
   }

   pub fn get(&self, group: GroupId) -> Option<GroupEntry> {
      self.entry(group).map(|entry| entry.lock().clone())
   }

   /// Records `volume` as the group's intent and commands every connected
   /// member. Returns how many members were commanded.
   pub fn set_volume(
      &self,
      group: GroupId,
      volume: u8,
      stack: &dyn NativeStack,
      lookup: &dyn ConnectionLookup,
   ) -> usize {
      let members: Vec<Address> = {
         let entry = self.entry_or_default(group);
         let mut entry = entry.lock();
         entry.volume = Some(volume);
         entry.members.iter().copied().collect()
      };

      let mut commanded = 0;
      for member in members {
         if lookup.is_connected(member) {
            stack.set_volume(member, volume);
            commanded += 1;
         }
      }
      info!("{group}: volume set to {volume}, {commanded} member(s) commanded");
      commanded
   }

   /// Records the group mute flag and commands the group.
   pub fn set_mute(&self, group: GroupId, mute: bool, stack: &dyn NativeStack) {
      self.entry_or_default(group).lock().mute = Some(mute);
      if mute {
         stack.mute_group(group);
      } else {
         stack.unmute_group(group);
      }
      info!("{group}: mute set to {mute}");
   }

   /// Applies a volume report.
   ///
   /// Reports are authoritative and always overwrite the cache. An autonomous
   /// change from a single member that moves the group away from its cached
   /// state is commanded to the whole group so the other members follow.
   pub fn apply_report(
      &self,
      group: GroupId,
      report: VolumeReport,
      stack: &dyn NativeStack,
   ) -> Previous {
      let previous = {
         let entry = self.entry_or_default(group);
         let mut entry = entry.lock();
         Previous {
            volume: entry.volume.replace(report.volume),
            mute: entry.mute.replace(report.mute),
         }
      };

      if report.autonomous
         && let Some(reporter) = report.reporter
      {
         if previous.volume.is_some_and(|v| v != report.volume) {
            debug!("{group}: {reporter} changed volume to {}, syncing group", report.volume);
            stack.set_group_volume(group, report.volume);
         }
         if previous.mute.is_some_and(|m| m != report.mute) {
            debug!("{group}: {reporter} changed mute to {}, syncing group", report.mute);
            if report.mute {
               stack.mute_group(group);
            } else {
               stack.unmute_group(group);
            }
         }
      }
      previous
   }

   /// Registers `device` as a freshly connected member and pushes the cached
   /// state to it. Returns whether anything was pushed.
   pub fn sync_connected_member(
      &self,
      group: GroupId,
      device: Address,
      stack: &dyn NativeStack,
   ) -> bool {
      self.forget_member_except(device, group);
      let state = {
         let entry = self.entry_or_default(group);
         let mut entry = entry.lock();
         entry.members.insert(device);
         entry.state()
      };
      let pushed = state.push_to(device, stack);
      if pushed {
         debug!("{group}: restored cached state on {device}");
      }
      pushed
   }

   /// Handles a late membership resolution.
   ///
   /// A device that is already `Connected` and newly joins a group with a
   /// cached state receives it exactly once; known members are left alone.
   pub fn resolve_member(
      &self,
      group: GroupId,
      device: Address,
      stack: &dyn NativeStack,
      lookup: &dyn ConnectionLookup,
   ) -> bool {
      self.forget_member_except(device, group);
      let state = {
         let entry = self.entry_or_default(group);
         let mut entry = entry.lock();
         if !entry.members.insert(device) {
            return false;
         }
         entry.state()
      };
      if !lookup.is_connected(device) {
         return false;
      }
      let pushed = state.push_to(device, stack);
      if pushed {
         info!("{group}: late member {device} synced to group state");
      }
      pushed
   }

   /// Removes `device` from every group.
   pub fn forget_member(&self, device: Address) {
      for entry in self.all_entries() {
         entry.lock().members.remove(&device);
      }
   }

   fn forget_member_except(&self, device: Address, keep: GroupId) {
      let others: Vec<_> = self
         .groups
         .read()
         .iter()
         .filter(|(group, _)| **group != keep)
         .map(|(_, entry)| entry.clone())
         .collect();
      for entry in others {
         entry.lock().members.remove(&device);
      }
   }

   /// Group `device` is currently a member of, as known to the cache.
   pub fn group_of(&self, device: Address) -> Option<GroupId> {
      let groups: Vec<_> = self
         .groups
         .read()
         .iter()
         .map(|(group, entry)| (*group, entry.clone()))
         .collect();
      groups
         .into_iter()
         .find(|(_, entry)| entry.lock().members.contains(&device))
         .map(|(group, _)| group)
   }

   fn all_entries(&self) -> Vec<Arc<Mutex<GroupEntry>>> {
      self.groups.read().values().cloned().collect()
   }

   pub fn clear(&self) {
      self.groups.write().clear();
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut groups: Vec<_> = self
         .groups
         .read()
         .iter()
         .map(|(group, entry)| (*group, entry.lock().clone()))
         .collect();
      groups.sort_by_key(|(group, _)| *group);

      let list: Vec<_> = groups
         .into_iter()
         .map(|(group, entry)| {
            json!({
                "group": group.0,
                "volume": entry.volume,
                "mute": entry.mute,
                "members": entry.members.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            })
         })
         .collect();
      json!(list)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::{Command, MockStack, addr};

   const G1: GroupId = GroupId(1);
   const G2: GroupId = GroupId(2);

   fn all_connected(_: Address) -> bool {
      true
   }

   fn none_connected(_: Address) -> bool {
      false
   }

   #[test]
   fn test_unknown_group_reads_as_none() {
      let cache = GroupVolumeCache::new();
      assert_eq!(cache.volume(G1), None);
      assert_eq!(cache.mute(G1), None);
      assert!(cache.members(G1).is_empty());
      assert!(cache.get(G1).is_none());
   }

   #[test]
   fn test_set_volume_commands_connected_members_once() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.sync_connected_member(G1, addr(1), &stack);
      cache.sync_connected_member(G1, addr(2), &stack);
      cache.sync_connected_member(G2, addr(3), &stack);
      assert!(stack.take().is_empty());

      let connected = |device: Address| device != addr(2);
      assert_eq!(cache.set_volume(G1, 56, &stack, &connected), 1);
      assert_eq!(stack.take(), vec![Command::SetVolume(addr(1), 56)]);
      assert_eq!(cache.volume(G1), Some(56));
      assert_eq!(cache.volume(G2), None);
   }

   #[test]
   fn test_intent_reaches_members_connecting_later() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      assert_eq!(cache.set_volume(G1, 56, &stack, &all_connected), 0);

      assert!(cache.sync_connected_member(G1, addr(1), &stack));
      assert_eq!(stack.take(), vec![Command::SetVolume(addr(1), 56)]);
   }

   #[test]
   fn test_newer_intent_supersedes() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 10, &stack, &all_connected);
      cache.set_volume(G1, 90, &stack, &all_connected);
      cache.sync_connected_member(G1, addr(1), &stack);
      assert_eq!(stack.take(), vec![Command::SetVolume(addr(1), 90)]);
   }

   #[test]
   fn test_late_member_synced_exactly_once() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 40, &stack, &all_connected);

      assert!(cache.resolve_member(G1, addr(2), &stack, &all_connected));
      assert!(!cache.resolve_member(G1, addr(2), &stack, &all_connected));
      assert_eq!(stack.take(), vec![Command::SetVolume(addr(2), 40)]);
   }

   #[test]
   fn test_late_member_without_cached_value() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 40, &stack, &all_connected);

      assert!(!cache.resolve_member(G2, addr(2), &stack, &all_connected));
      assert!(stack.take().is_empty());
      assert_eq!(cache.members(G2), vec![addr(2)]);
   }

   #[test]
   fn test_late_member_not_connected() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 40, &stack, &none_connected);
      assert!(!cache.resolve_member(G1, addr(2), &stack, &none_connected));
      assert!(stack.take().is_empty());
   }

   #[test]
   fn test_mute_is_pushed_with_volume() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_mute(G1, true, &stack);
      assert_eq!(stack.take(), vec![Command::MuteGroup(G1)]);

      cache.sync_connected_member(G1, addr(1), &stack);
      assert_eq!(stack.take(), vec![Command::Mute(addr(1))]);
      assert_eq!(cache.volume(G1), None);
      assert_eq!(cache.mute(G1), Some(true));
   }

   #[test]
   fn test_autonomous_report_propagates_to_group() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 30, &stack, &none_connected);

      let report = VolumeReport {
         volume: 80,
         mute: false,
         autonomous: true,
         reporter: Some(addr(1)),
      };
      let previous = cache.apply_report(G1, report, &stack);
      assert_eq!(previous.volume, Some(30));
      assert_eq!(previous.mute, None);
      assert_eq!(stack.take(), vec![Command::SetGroupVolume(G1, 80)]);
      assert_eq!(cache.volume(G1), Some(80));
      assert_eq!(cache.mute(G1), Some(false));

      // Same value again: nothing to sync.
      cache.apply_report(G1, report, &stack);
      assert!(stack.take().is_empty());
   }

   #[test]
   fn test_commanded_report_only_updates_cache() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G1, 30, &stack, &none_connected);
      cache.apply_report(
         G1,
         VolumeReport {
            volume: 31,
            mute: true,
            autonomous: false,
            reporter: Some(addr(1)),
         },
         &stack,
      );
      assert!(stack.take().is_empty());
      assert_eq!(cache.volume(G1), Some(31));
      assert_eq!(cache.mute(G1), Some(true));
   }

   #[test]
   fn test_member_moves_between_groups() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.sync_connected_member(G1, addr(1), &stack);
      cache.resolve_member(G2, addr(1), &stack, &all_connected);
      assert!(cache.members(G1).is_empty());
      assert_eq!(cache.group_of(addr(1)), Some(G2));

      cache.forget_member(addr(1));
      assert_eq!(cache.group_of(addr(1)), None);
   }

   /// Stack that reads the cache back while handling every command.
   struct EchoStack<'a> {
      cache: &'a GroupVolumeCache,
      inner: MockStack,
      seen: parking_lot::Mutex<Vec<Option<u8>>>,
   }

   impl NativeStack for EchoStack<'_> {
      fn connect(&self, device: Address) {
         self.inner.connect(device);
      }

      fn disconnect(&self, device: Address) {
         self.inner.disconnect(device);
      }

      fn set_volume(&self, device: Address, volume: u8) {
         self.seen.lock().push(self.cache.volume(G1));
         self.inner.set_volume(device, volume);
      }

      fn set_group_volume(&self, group: GroupId, volume: u8) {
         self.seen.lock().push(self.cache.volume(group));
         self.inner.set_group_volume(group, volume);
      }

      fn mute(&self, device: Address) {
         self.seen.lock().push(self.cache.volume(G1));
         self.inner.mute(device);
      }

      fn unmute(&self, device: Address) {
         self.inner.unmute(device);
      }

      fn mute_group(&self, group: GroupId) {
         self.seen.lock().push(self.cache.volume(group));
         self.inner.mute_group(group);
      }

      fn unmute_group(&self, group: GroupId) {
         self.inner.unmute_group(group);
      }

      fn set_ext_output_offset(&self, device: Address, output_id: u8, offset: i16) {
         self.inner.set_ext_output_offset(device, output_id, offset);
      }
   }

   #[test]
   fn test_stack_may_reenter_cache() {
      let cache = GroupVolumeCache::new();
      let stack = EchoStack {
         cache: &cache,
         inner: MockStack::default(),
         seen: parking_lot::Mutex::new(Vec::new()),
      };
      cache.sync_connected_member(G1, addr(1), &stack);
      cache.set_volume(G1, 20, &stack, &all_connected);
      cache.set_mute(G1, true, &stack);
      cache.resolve_member(G1, addr(2), &stack, &all_connected);
      cache.apply_report(
         G1,
         VolumeReport {
            volume: 60,
            mute: false,
            autonomous: true,
            reporter: Some(addr(1)),
         },
         &stack,
      );
      assert_eq!(stack.inner.take(), vec![
         Command::SetVolume(addr(1), 20),
         Command::MuteGroup(G1),
         Command::SetVolume(addr(2), 20),
         Command::Mute(addr(2)),
         Command::SetGroupVolume(G1, 60),
         Command::UnmuteGroup(G1),
      ]);
      assert_eq!(*stack.seen.lock(), vec![
         Some(20),
         Some(20),
         Some(20),
         Some(20),
         Some(60)
      ]);
   }

   #[test]
   fn test_json_snapshot() {
      let cache = GroupVolumeCache::new();
      let stack = MockStack::default();
      cache.set_volume(G2, 7, &stack, &all_connected);
      cache.sync_connected_member(G1, addr(1), &stack);
      let json = cache.to_json();
      assert_eq!(json[0]["group"], 1);
      assert!(json[0]["volume"].is_null());
      assert_eq!(json[1]["volume"], 7);

      cache.clear();
      assert_eq!(cache.to_json(), json!([]));
   }
}
