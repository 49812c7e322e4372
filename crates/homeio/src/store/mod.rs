//! Persistence boundary for devices, groups, rooms and the command queue.
//!
//! Two backends implement the same traits: [`MemoryStore`] (tests, ephemeral
//! runs) and [`SqliteStore`]. The engine only ever sees `dyn Store`.

mod memory;
mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
use tracing::info;

use crate::config::StoreBackend;
use crate::config::StoreConfig;
use crate::engine::BrightnessPresets;
use crate::engine::Command;
use crate::engine::CommandQueueEntry;
use crate::engine::CommandStatus;
use crate::engine::Device;
use crate::engine::DeviceDescriptor;
use crate::engine::DeviceGroup;
use crate::engine::EntryId;
use crate::engine::GroupId;
use crate::engine::NewCommand;
use crate::engine::PowerState;
use crate::engine::Room;
use crate::engine::RoomId;
use crate::engine::StateProperties;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare store location: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {what} record: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("no such device: {0}")]
    UnknownDevice(String),

    #[error("no such device group: {0}")]
    UnknownGroup(GroupId),

    #[error("no such command queue entry: {0}")]
    UnknownEntry(EntryId),

    #[error("command {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EntryId,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("the sqlite store needs a path")]
    MissingPath,
}

/// Which devices a listing covers. The variants are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    #[default]
    All,
    Single(String),
    Room(RoomId),
    /// Everything not in this room, including devices with no room at all
    ExcludeRoom(RoomId),
}

impl DeviceFilter {
    pub fn matches(&self, device: &Device) -> bool {
        match self {
            DeviceFilter::All => true,
            DeviceFilter::Single(id) => device.id == *id,
            DeviceFilter::Room(room) => device.room == Some(*room),
            DeviceFilter::ExcludeRoom(room) => device.room != Some(*room),
        }
    }
}

/// Outcome of merging an adapter descriptor into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted(Device),
    Updated(Device),
}

impl Upsert {
    pub fn device(&self) -> &Device {
        match self {
            Upsert::Inserted(d) | Upsert::Updated(d) => d,
        }
    }

    pub fn into_device(self) -> Device {
        match self {
            Upsert::Inserted(d) | Upsert::Updated(d) => d,
        }
    }
}

/// Caller-owned configuration of a device. Applied as a whole, replacing the
/// previous values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfigUpdate {
    pub room: Option<RoomId>,
    pub presets: BrightnessPresets,
    pub preferred_color_temp: Option<u16>,
    pub x10_code: Option<String>,
    pub preferred_name: Option<String>,
}

impl DeviceConfigUpdate {
    pub fn apply_to(&self, device: &mut Device) {
        device.room = self.room;
        device.presets = self.presets;
        device.preferred_color_temp = self.preferred_color_temp;
        device.x10_code = self.x10_code.clone().filter(|c| !c.is_empty());
        device.preferred_name = self.preferred_name.clone().filter(|n| !n.is_empty());
    }
}

/// Record a preferred value on a device.
///
/// A brightness preference also asks for the device to be on: dimming a light
/// that is off means turning it on at that level.
pub fn apply_preference(device: &mut Device, command: Command) {
    match command {
        Command::Turn(power) => device.preferred_power = Some(power),
        Command::Brightness(level) => {
            device.preferred_brightness = Some(level);
            device.preferred_power = Some(PowerState::On);
        }
    }
}

/// Canonical device attributes, preferred vs. actual state, rooms and groups.
pub trait DeviceStore: Send + Sync {
    /// Insert a new device, or refresh the vendor-owned fields of a known one.
    fn upsert_device(&self, descriptor: &DeviceDescriptor) -> Result<Upsert, StoreError>;

    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError>;

    /// Devices matching `filter`, ordered by id.
    fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError>;

    /// Record freshly observed state on the `actual_*` side.
    fn apply_observed(&self, id: &str, state: &StateProperties) -> Result<Device, StoreError>;

    /// Persist the preferred value carried by `command`.
    fn set_preferred(&self, id: &str, command: Command) -> Result<Device, StoreError>;

    fn update_config(&self, id: &str, update: &DeviceConfigUpdate) -> Result<Device, StoreError>;

    /// Look up the device using an X10 code, ignoring `excluding`.
    fn find_by_x10(&self, code: &str, excluding: Option<&str>) -> Result<Option<Device>, StoreError>;

    fn insert_room(&self, name: &str) -> Result<Room, StoreError>;

    fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Create a group and make `reference_device` its first, visible member.
    fn create_group(
        &self,
        name: &str,
        model: &str,
        reference_device: &str,
    ) -> Result<DeviceGroup, StoreError>;

    fn get_group(&self, id: GroupId) -> Result<Option<DeviceGroup>, StoreError>;

    fn list_groups(&self) -> Result<Vec<DeviceGroup>, StoreError>;

    /// Set (or with `None`, clear) a device's group and `show_in_group_only` flag.
    fn set_membership(
        &self,
        device: &str,
        membership: Option<(GroupId, bool)>,
    ) -> Result<Device, StoreError>;

    /// Remove every member from the group, then the group itself.
    fn delete_group(&self, id: GroupId) -> Result<(), StoreError>;

    /// Members of a group, ordered by display name.
    fn group_members(&self, id: GroupId) -> Result<Vec<Device>, StoreError>;
}

/// Ordered work list of actuation commands.
pub trait CommandQueue: Send + Sync {
    /// Enqueue unconditionally.
    fn enqueue(&self, command: NewCommand) -> Result<CommandQueueEntry, StoreError>;

    /// Enqueue only if the device has no pending or processing entry.
    ///
    /// The check and the insert are one atomic step: two concurrent callers can
    /// never both see "nothing pending" and both enqueue.
    fn enqueue_unless_pending(
        &self,
        command: NewCommand,
    ) -> Result<Option<CommandQueueEntry>, StoreError>;

    fn has_pending(&self, device: &str) -> Result<bool, StoreError>;

    /// Pending and processing entries for one device, oldest first.
    fn list_pending(&self, device: &str) -> Result<Vec<CommandQueueEntry>, StoreError>;

    /// Every device with a pending or processing entry, in one query.
    fn pending_devices(&self) -> Result<HashSet<String>, StoreError>;

    fn get_entry(&self, id: EntryId) -> Result<Option<CommandQueueEntry>, StoreError>;

    /// Move an entry along its lifecycle. Rejects transitions the state machine
    /// does not allow.
    fn transition(&self, id: EntryId, to: CommandStatus) -> Result<CommandQueueEntry, StoreError>;
}

/// Everything the engine needs from persistence.
pub trait Store: DeviceStore + CommandQueue {}

impl<T: DeviceStore + CommandQueue> Store for T {}

/// Open the store described by the configuration.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = config.path.as_deref().ok_or(StoreError::MissingPath)?;
            info!("Opening sqlite store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Brightness;

    fn device(id: &str, room: Option<RoomId>) -> Device {
        let mut d = Device::from_descriptor(&DeviceDescriptor {
            id: id.to_string(),
            brand: "govee".to_string(),
            model: "H6008".to_string(),
            name: id.to_string(),
            raw: serde_json::Value::Null,
        });
        d.room = room;
        d
    }

    #[test]
    fn test_filter_matches() {
        let in_kitchen = device("a", Some(RoomId(1)));
        let in_hall = device("b", Some(RoomId(2)));
        let nowhere = device("c", None);

        let only_kitchen = DeviceFilter::Room(RoomId(1));
        assert!(only_kitchen.matches(&in_kitchen));
        assert!(!only_kitchen.matches(&in_hall));
        assert!(!only_kitchen.matches(&nowhere));

        let not_kitchen = DeviceFilter::ExcludeRoom(RoomId(1));
        assert!(!not_kitchen.matches(&in_kitchen));
        assert!(not_kitchen.matches(&in_hall));
        assert!(not_kitchen.matches(&nowhere));

        assert!(DeviceFilter::Single("c".to_string()).matches(&nowhere));
        assert!(DeviceFilter::All.matches(&in_hall));
    }

    #[test]
    fn test_brightness_preference_requests_power_on() {
        let mut d = device("a", None);
        d.preferred_power = Some(PowerState::Off);
        apply_preference(&mut d, Command::Brightness(Brightness::saturating(30)));
        assert_eq!(d.preferred_power, Some(PowerState::On));
        assert_eq!(d.preferred_brightness, Some(Brightness::saturating(30)));

        apply_preference(&mut d, Command::Turn(PowerState::Off));
        assert_eq!(d.preferred_power, Some(PowerState::Off));
        assert_eq!(d.preferred_brightness, Some(Brightness::saturating(30)));
    }

    #[test]
    fn test_config_update_treats_empty_strings_as_unset() {
        let mut d = device("a", None);
        DeviceConfigUpdate {
            room: Some(RoomId(4)),
            x10_code: Some(String::new()),
            preferred_name: Some("Porch".to_string()),
            ..Default::default()
        }
        .apply_to(&mut d);

        assert_eq!(d.room, Some(RoomId(4)));
        assert_eq!(d.x10_code, None);
        assert_eq!(d.display_name(), "Porch");
    }
}
