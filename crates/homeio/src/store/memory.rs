use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::Utc;

use super::CommandQueue;
use super::DeviceConfigUpdate;
use super::DeviceFilter;
use super::DeviceStore;
use super::StoreError;
use super::Upsert;
use super::apply_preference;
use crate::engine::Command;
use crate::engine::CommandQueueEntry;
use crate::engine::CommandStatus;
use crate::engine::Device;
use crate::engine::DeviceDescriptor;
use crate::engine::DeviceGroup;
use crate::engine::EntryId;
use crate::engine::GroupId;
use crate::engine::NewCommand;
use crate::engine::Room;
use crate::engine::RoomId;
use crate::engine::StateProperties;

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<String, Device>,
    rooms: BTreeMap<RoomId, Room>,
    groups: BTreeMap<GroupId, DeviceGroup>,
    commands: BTreeMap<EntryId, CommandQueueEntry>,
    /// device id -> ids of its pending/processing entries
    outstanding: HashMap<String, BTreeSet<EntryId>>,
    next_room: i64,
    next_group: i64,
    next_entry: i64,
}

impl Inner {
    fn device_mut(&mut self, id: &str) -> Result<&mut Device, StoreError> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownDevice(id.to_string()))
    }

    fn has_outstanding(&self, device: &str) -> bool {
        self.outstanding
            .get(device)
            .is_some_and(|ids| !ids.is_empty())
    }

    fn push_command(&mut self, command: NewCommand) -> CommandQueueEntry {
        self.next_entry += 1;
        let entry = CommandQueueEntry {
            id: EntryId(self.next_entry),
            device: command.device,
            model: command.model,
            brand: command.brand,
            command: command.command,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
        };
        self.outstanding
            .entry(entry.device.clone())
            .or_default()
            .insert(entry.id);
        self.commands.insert(entry.id, entry.clone());
        entry
    }
}

/// Store that keeps everything in process memory.
///
/// One mutex covers the whole state, so every trait method is atomic on its own.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn update_device<F>(&self, id: &str, f: F) -> Result<Device, StoreError>
    where
        F: FnOnce(&mut Device),
    {
        let mut inner = self.lock()?;
        let device = inner.device_mut(id)?;
        f(device);
        Ok(device.clone())
    }
}

impl DeviceStore for MemoryStore {
    fn upsert_device(&self, descriptor: &DeviceDescriptor) -> Result<Upsert, StoreError> {
        let mut inner = self.lock()?;
        match inner.devices.get_mut(&descriptor.id) {
            Some(existing) => {
                existing.refresh_identity(descriptor);
                Ok(Upsert::Updated(existing.clone()))
            }
            None => {
                let device = Device::from_descriptor(descriptor);
                inner.devices.insert(device.id.clone(), device.clone());
                Ok(Upsert::Inserted(device))
            }
        }
    }

    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.lock()?.devices.get(id).cloned())
    }

    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    fn apply_observed(&self, id: &str, state: &StateProperties) -> Result<Device, StoreError> {
        self.update_device(id, |d| state.apply_to(d))
    }

    fn set_preferred(&self, id: &str, command: Command) -> Result<Device, StoreError> {
        self.update_device(id, |d| apply_preference(d, command))
    }

    fn update_config(&self, id: &str, update: &DeviceConfigUpdate) -> Result<Device, StoreError> {
        self.update_device(id, |d| update.apply_to(d))
    }

    fn find_by_x10(&self, code: &str, excluding: Option<&str>) -> Result<Option<Device>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .devices
            .values()
            .find(|d| d.x10_code.as_deref() == Some(code) && Some(d.id.as_str()) != excluding)
            .cloned())
    }

    fn insert_room(&self, name: &str) -> Result<Room, StoreError> {
        let mut inner = self.lock()?;
        inner.next_room += 1;
        let room = Room {
            id: RoomId(inner.next_room),
            name: name.to_string(),
        };
        inner.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.lock()?.rooms.values().cloned().collect())
    }

    fn create_group(
        &self,
        name: &str,
        model: &str,
        reference_device: &str,
    ) -> Result<DeviceGroup, StoreError> {
        let mut inner = self.lock()?;
        // Check before allocating so a bad reference leaves no half-made group.
        inner.device_mut(reference_device)?;

        inner.next_group += 1;
        let group = DeviceGroup {
            id: GroupId(inner.next_group),
            name: name.to_string(),
            model: model.to_string(),
            reference_device: reference_device.to_string(),
        };
        inner.groups.insert(group.id, group.clone());

        let device = inner.device_mut(reference_device)?;
        device.group = Some(group.id);
        device.show_in_group_only = false;
        Ok(group)
    }

    fn get_group(&self, id: GroupId) -> Result<Option<DeviceGroup>, StoreError> {
        Ok(self.lock()?.groups.get(&id).cloned())
    }

    fn list_groups(&self) -> Result<Vec<DeviceGroup>, StoreError> {
        Ok(self.lock()?.groups.values().cloned().collect())
    }

    fn set_membership(
        &self,
        device: &str,
        membership: Option<(GroupId, bool)>,
    ) -> Result<Device, StoreError> {
        let mut inner = self.lock()?;
        if let Some((group, _)) = membership {
            if !inner.groups.contains_key(&group) {
                return Err(StoreError::UnknownGroup(group));
            }
        }
        let d = inner.device_mut(device)?;
        d.group = membership.map(|(g, _)| g);
        d.show_in_group_only = membership.is_some_and(|(_, only)| only);
        Ok(d.clone())
    }

    fn delete_group(&self, id: GroupId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.groups.remove(&id).is_none() {
            return Err(StoreError::UnknownGroup(id));
        }
        for device in inner.devices.values_mut() {
            if device.group == Some(id) {
                device.group = None;
                device.show_in_group_only = false;
            }
        }
        Ok(())
    }

    fn group_members(&self, id: GroupId) -> Result<Vec<Device>, StoreError> {
        let inner = self.lock()?;
        let mut members: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.group == Some(id))
            .cloned()
            .collect();
        members.sort_by(|a, b| {
            a.display_name()
                .cmp(b.display_name())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(members)
    }
}

impl CommandQueue for MemoryStore {
    fn enqueue(&self, command: NewCommand) -> Result<CommandQueueEntry, StoreError> {
        Ok(self.lock()?.push_command(command))
    }

    fn enqueue_unless_pending(
        &self,
        command: NewCommand,
    ) -> Result<Option<CommandQueueEntry>, StoreError> {
        let mut inner = self.lock()?;
        if inner.has_outstanding(&command.device) {
            return Ok(None);
        }
        Ok(Some(inner.push_command(command)))
    }

    fn has_pending(&self, device: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.has_outstanding(device))
    }

    fn list_pending(&self, device: &str) -> Result<Vec<CommandQueueEntry>, StoreError> {
        let inner = self.lock()?;
        let Some(ids) = inner.outstanding.get(device) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.commands.get(id))
            .cloned()
            .collect())
    }

    fn pending_devices(&self) -> Result<HashSet<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .outstanding
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(device, _)| device.clone())
            .collect())
    }

    fn get_entry(&self, id: EntryId) -> Result<Option<CommandQueueEntry>, StoreError> {
        Ok(self.lock()?.commands.get(&id).cloned())
    }

    fn transition(&self, id: EntryId, to: CommandStatus) -> Result<CommandQueueEntry, StoreError> {
        let mut inner = self.lock()?;
        let entry = inner
            .commands
            .get_mut(&id)
            .ok_or(StoreError::UnknownEntry(id))?;
        if !entry.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        let entry = entry.clone();

        if !to.is_outstanding() {
            if let Some(ids) = inner.outstanding.get_mut(&entry.device) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.outstanding.remove(&entry.device);
                }
            }
        }
        Ok(entry)
    }
}
