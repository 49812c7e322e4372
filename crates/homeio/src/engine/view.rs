//! Caller-facing device snapshot.
//!
//! Devices with a command in flight are left out of the default listing (the
//! caller would otherwise see a state that is about to change), and group members
//! that only show through their group are folded under the reference device.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::device::Brightness;
use super::device::BrightnessPresets;
use super::device::Device;
use super::device::DeviceGroup;
use super::device::GroupId;
use super::device::PowerState;
use super::device::RoomId;
use super::error::EngineError;
use super::guard::PendingCommandGuard;
use super::guard::PendingSet;
use crate::store::DeviceFilter;
use crate::store::Store;

/// Filters a caller may pass when listing devices. At most one may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceQuery {
    pub device: Option<String>,
    pub room: Option<RoomId>,
    pub exclude_room: Option<RoomId>,
}

impl DeviceQuery {
    pub fn to_filter(&self) -> Result<DeviceFilter, EngineError> {
        match (&self.device, self.room, self.exclude_room) {
            (None, None, None) => Ok(DeviceFilter::All),
            (Some(id), None, None) => Ok(DeviceFilter::Single(id.clone())),
            (None, Some(room), None) => Ok(DeviceFilter::Room(room)),
            (None, None, Some(room)) => Ok(DeviceFilter::ExcludeRoom(room)),
            _ => Err(EngineError::validation(
                "only one of device, room and exclude_room may be given",
            )),
        }
    }
}

/// A device as shown to callers: preferred values overlaid on observed ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub device: String,
    pub name: String,
    pub brand: String,
    pub model: String,
    pub power_state: Option<PowerState>,
    pub brightness: Option<Brightness>,
    pub online: bool,
    pub room: Option<RoomId>,
    pub room_name: Option<String>,
    pub group_id: Option<GroupId>,
    pub group_name: Option<String>,
    pub presets: BrightnessPresets,
    pub preferred_color_temp: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_members: Option<Vec<DeviceView>>,
}

struct Lookup {
    rooms: HashMap<RoomId, String>,
    groups: HashMap<GroupId, DeviceGroup>,
}

impl Lookup {
    fn reference_of(&self, device: &Device) -> Option<&str> {
        device
            .group
            .and_then(|g| self.groups.get(&g))
            .map(|g| g.reference_device.as_str())
    }

    fn view(&self, device: &Device) -> DeviceView {
        let group = device.group.and_then(|g| self.groups.get(&g));
        DeviceView {
            device: device.id.clone(),
            name: device.display_name().to_string(),
            brand: device.brand.clone(),
            model: device.model.clone(),
            power_state: device.effective_power(),
            brightness: device.effective_brightness(),
            online: device.online,
            room: device.room,
            room_name: device.room.and_then(|r| self.rooms.get(&r)).cloned(),
            group_id: device.group,
            group_name: group.map(|g| g.name.clone()),
            presets: device.presets,
            preferred_color_temp: device.preferred_color_temp,
            group_members: None,
        }
    }
}

#[derive(Clone)]
pub struct DeviceViewBuilder {
    store: Arc<dyn Store>,
    guard: PendingCommandGuard,
}

impl DeviceViewBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            guard: PendingCommandGuard::new(store.clone()),
            store,
        }
    }

    /// Build the device listing for `query`, ordered by device id.
    ///
    /// A single-device query returns that device even if it is pending or hidden
    /// behind its group, and fails with `NotFound` if the id is unknown.
    pub fn build(&self, query: &DeviceQuery) -> Result<Vec<DeviceView>, EngineError> {
        let filter = query.to_filter()?;

        let rooms: HashMap<RoomId, String> = self
            .store
            .list_rooms()?
            .into_iter()
            .map(|r| (r.id, r.name))
            .collect();
        if let DeviceFilter::Room(room) | DeviceFilter::ExcludeRoom(room) = filter {
            if !rooms.contains_key(&room) {
                return Err(EngineError::NotFound(format!("room {}", room)));
            }
        }
        let lookup = Lookup {
            rooms,
            groups: self
                .store
                .list_groups()?
                .into_iter()
                .map(|g| (g.id, g))
                .collect(),
        };

        let devices = self.store.list_devices(&filter)?;
        let pending = self.guard.snapshot()?;

        if let DeviceFilter::Single(id) = &filter {
            let device = devices
                .first()
                .ok_or_else(|| EngineError::device_not_found(id))?;
            return Ok(vec![self.view_with_members(&lookup, &pending, device)?]);
        }

        let mut views = Vec::with_capacity(devices.len());
        for device in &devices {
            if pending.contains(&device.id) {
                debug!(device = %device.id, "Hiding device with a command in flight");
                continue;
            }
            if device.hidden_behind_group(lookup.reference_of(device)) {
                continue;
            }
            views.push(self.view_with_members(&lookup, &pending, device)?);
        }
        Ok(views)
    }

    fn view_with_members(
        &self,
        lookup: &Lookup,
        pending: &PendingSet,
        device: &Device,
    ) -> Result<DeviceView, EngineError> {
        let mut view = lookup.view(device);
        let Some(group) = device.group else {
            return Ok(view);
        };
        if lookup.reference_of(device) != Some(device.id.as_str()) {
            return Ok(view);
        }

        let members = self
            .store
            .group_members(group)?
            .iter()
            .filter(|m| m.id != device.id && !pending.contains(&m.id))
            .map(|m| lookup.view(m))
            .collect();
        view.group_members = Some(members);
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Command;
    use crate::engine::DeviceDescriptor;
    use crate::engine::NewCommand;
    use crate::store::CommandQueue;
    use crate::store::DeviceStore;
    use crate::store::MemoryStore;

    fn add(store: &MemoryStore, id: &str, name: &str) {
        store
            .upsert_device(&DeviceDescriptor {
                id: id.to_string(),
                brand: "hue".to_string(),
                model: "LCT015".to_string(),
                name: name.to_string(),
                raw: serde_json::Value::Null,
            })
            .unwrap();
    }

    #[test]
    fn test_query_rejects_combined_filters() {
        let query = DeviceQuery {
            room: Some(RoomId(1)),
            exclude_room: Some(RoomId(2)),
            ..Default::default()
        };
        assert!(matches!(query.to_filter(), Err(EngineError::Validation(_))));

        let query = DeviceQuery {
            device: Some("D1".to_string()),
            room: Some(RoomId(1)),
            ..Default::default()
        };
        assert!(matches!(query.to_filter(), Err(EngineError::Validation(_))));

        assert_eq!(DeviceQuery::default().to_filter().unwrap(), DeviceFilter::All);
    }

    #[test]
    fn test_view_shape() {
        let store = Arc::new(MemoryStore::new());
        add(&store, "hue-1", "Hall");
        let room = store.insert_room("Hallway").unwrap();
        store
            .update_config(
                "hue-1",
                &crate::store::DeviceConfigUpdate {
                    room: Some(room.id),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .set_preferred("hue-1", Command::Brightness(Brightness::saturating(40)))
            .unwrap();

        let views = DeviceViewBuilder::new(store).build(&DeviceQuery::default()).unwrap();
        let json = serde_json::to_string_pretty(&views[0]).unwrap();
        insta::assert_snapshot!(json, @r#"
        {
          "device": "hue-1",
          "name": "Hall",
          "brand": "hue",
          "model": "LCT015",
          "power_state": "on",
          "brightness": 40,
          "online": false,
          "room": 1,
          "room_name": "Hallway",
          "group_id": null,
          "group_name": null,
          "presets": {
            "low": null,
            "medium": null,
            "high": null
          },
          "preferred_color_temp": null
        }
        "#);
    }

    #[test]
    fn test_group_members_fold_under_reference() {
        let store = Arc::new(MemoryStore::new());
        add(&store, "a", "Zeta");
        add(&store, "b", "Alpha");
        add(&store, "c", "Mid");
        let group = store.create_group("Kitchen", "LCT015", "a").unwrap();
        store.set_membership("b", Some((group.id, true))).unwrap();
        store.set_membership("c", Some((group.id, true))).unwrap();

        store
            .enqueue(NewCommand {
                device: "c".to_string(),
                model: "LCT015".to_string(),
                brand: "hue".to_string(),
                command: Command::Turn(PowerState::On),
            })
            .unwrap();

        let builder = DeviceViewBuilder::new(store);
        let views = builder.build(&DeviceQuery::default()).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].device, "a");
        assert_eq!(views[0].group_name.as_deref(), Some("Kitchen"));
        let members: Vec<&str> = views[0]
            .group_members
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.device.as_str())
            .collect();
        assert_eq!(members, vec!["b"]);

        // Asking for a hidden or pending device by id still returns it.
        let single = builder
            .build(&DeviceQuery {
                device: Some("c".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(single.len(), 1);
        assert!(single[0].group_members.is_none());
    }

    #[test]
    fn test_unknown_device_and_room() {
        let store = Arc::new(MemoryStore::new());
        add(&store, "a", "Lamp");
        let builder = DeviceViewBuilder::new(store);

        let missing = builder.build(&DeviceQuery {
            device: Some("nope".to_string()),
            ..Default::default()
        });
        assert!(matches!(missing, Err(EngineError::NotFound(_))));

        let no_room = builder.build(&DeviceQuery {
            room: Some(RoomId(9)),
            ..Default::default()
        });
        assert!(matches!(no_room, Err(EngineError::NotFound(_))));
    }
}
