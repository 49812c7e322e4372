use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum::AsRefStr;
use strum::Display;
use strum::EnumString;

/// Power state of a controllable device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PowerState {
    On,
    Off,
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on { PowerState::On } else { PowerState::Off }
    }
}

impl PowerState {
    pub fn is_on(self) -> bool {
        self == PowerState::On
    }
}

/// Brightness in the canonical scale: an integer percentage, 0-100.
///
/// Vendor scales (0-254 and friends) are converted at the adapter boundary with
/// [`BrightnessScale`](super::state::BrightnessScale); nothing past an adapter
/// ever sees a raw vendor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Brightness(u8);

impl Brightness {
    pub const MAX: u8 = 100;

    /// Returns `None` if `percent` is above 100.
    pub fn new(percent: u8) -> Option<Self> {
        (percent <= Self::MAX).then_some(Self(percent))
    }

    /// Clamp an arbitrary integer into the canonical range.
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(0, i64::from(Self::MAX)) as u8)
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Brightness {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Brightness::new)
            .ok_or_else(|| format!("brightness {} is outside 0-100", value))
    }
}

impl From<Brightness> for u8 {
    fn from(b: Brightness) -> Self {
        b.0
    }
}

impl fmt::Display for Brightness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a room.
    RoomId
);
id_type!(
    /// Identifier of a device group.
    GroupId
);
id_type!(
    /// Identifier of a command queue entry.
    EntryId
);

/// Caller-defined brightness presets, in the canonical scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrightnessPresets {
    pub low: Option<Brightness>,
    pub medium: Option<Brightness>,
    pub high: Option<Brightness>,
}

/// A device in the homeio system.
///
/// Observed (`actual_*`) and requested (`preferred_*`) state are kept apart. Only
/// the reconciliation merge writes the observed side; only caller writes touch the
/// preferred side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub brand: String,
    pub model: String,
    /// Name reported by the vendor
    pub name: String,
    /// Caller-chosen display name, wins over `name` when set
    pub preferred_name: Option<String>,

    pub actual_power: Option<PowerState>,
    pub actual_brightness: Option<Brightness>,
    pub preferred_power: Option<PowerState>,
    pub preferred_brightness: Option<Brightness>,

    pub online: bool,
    pub room: Option<RoomId>,
    pub group: Option<GroupId>,
    pub show_in_group_only: bool,

    pub presets: BrightnessPresets,
    pub preferred_color_temp: Option<u16>,
    pub x10_code: Option<String>,

    /// Vendor-specific fields carried through untouched
    pub vendor: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    /// Build a fresh device record from an adapter descriptor.
    ///
    /// Nothing has been observed yet, so both state sides are empty and the device
    /// counts as offline until its first state fetch.
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            brand: descriptor.brand.clone(),
            model: descriptor.model.clone(),
            name: descriptor.name.clone(),
            preferred_name: None,
            actual_power: None,
            actual_brightness: None,
            preferred_power: None,
            preferred_brightness: None,
            online: false,
            room: None,
            group: None,
            show_in_group_only: false,
            presets: BrightnessPresets::default(),
            preferred_color_temp: None,
            x10_code: None,
            vendor: descriptor.passthrough(),
        }
    }

    /// Refresh the vendor-owned identity fields. Caller-owned fields are untouched.
    pub fn refresh_identity(&mut self, descriptor: &DeviceDescriptor) {
        self.brand = descriptor.brand.clone();
        self.model = descriptor.model.clone();
        self.name = descriptor.name.clone();
        self.vendor = descriptor.passthrough();
    }

    pub fn display_name(&self) -> &str {
        self.preferred_name.as_deref().unwrap_or(&self.name)
    }

    /// Power state shown to callers: the preferred value if one is set.
    pub fn effective_power(&self) -> Option<PowerState> {
        self.preferred_power.or(self.actual_power)
    }

    /// Brightness shown to callers: the preferred value if one is set.
    pub fn effective_brightness(&self) -> Option<Brightness> {
        self.preferred_brightness.or(self.actual_brightness)
    }

    /// Whether this device is hidden behind its group's reference device.
    pub fn hidden_behind_group(&self, reference_device: Option<&str>) -> bool {
        self.group.is_some()
            && self.show_in_group_only
            && reference_device != Some(self.id.as_str())
    }
}

/// A device as listed by a vendor adapter, before it is merged into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub name: String,
    /// Raw vendor payload for this device
    pub raw: serde_json::Value,
}

impl DeviceDescriptor {
    fn passthrough(&self) -> serde_json::Map<String, serde_json::Value> {
        match &self.raw {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// A set of devices of one model represented by a single reference device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: GroupId,
    pub name: String,
    pub model: String,
    pub reference_device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::from_descriptor(&DeviceDescriptor {
            id: "D1".to_string(),
            brand: "govee".to_string(),
            model: "H6008".to_string(),
            name: "Desk lamp".to_string(),
            raw: serde_json::json!({"controllable": true}),
        })
    }

    #[test]
    fn test_overlay_is_per_field() {
        let mut d = device();
        d.actual_power = Some(PowerState::Off);
        d.actual_brightness = Some(Brightness::saturating(20));

        assert_eq!(d.effective_power(), Some(PowerState::Off));
        assert_eq!(d.effective_brightness(), Some(Brightness::saturating(20)));

        d.preferred_power = Some(PowerState::On);
        assert_eq!(d.effective_power(), Some(PowerState::On));
        assert_eq!(d.effective_brightness(), Some(Brightness::saturating(20)));

        d.preferred_power = None;
        d.preferred_brightness = Some(Brightness::saturating(80));
        assert_eq!(d.effective_power(), Some(PowerState::Off));
        assert_eq!(d.effective_brightness(), Some(Brightness::saturating(80)));
    }

    #[test]
    fn test_refresh_identity_keeps_caller_fields() {
        let mut d = device();
        d.room = Some(RoomId(3));
        d.preferred_power = Some(PowerState::On);
        d.preferred_name = Some("Lamp".to_string());

        d.refresh_identity(&DeviceDescriptor {
            id: "D1".to_string(),
            brand: "govee".to_string(),
            model: "H6008".to_string(),
            name: "Renamed by vendor".to_string(),
            raw: serde_json::Value::Null,
        });

        assert_eq!(d.name, "Renamed by vendor");
        assert_eq!(d.display_name(), "Lamp");
        assert_eq!(d.room, Some(RoomId(3)));
        assert_eq!(d.preferred_power, Some(PowerState::On));
        assert!(d.vendor.is_empty());
    }

    #[test]
    fn test_brightness_bounds() {
        assert_eq!(Brightness::new(101), None);
        assert_eq!(Brightness::saturating(-5).percent(), 0);
        assert_eq!(Brightness::saturating(300).percent(), 100);
        assert!(Brightness::try_from(254).is_err());
        assert_eq!("ON".parse::<PowerState>().unwrap(), PowerState::On);
    }

    #[test]
    fn test_hidden_behind_group() {
        let mut d = device();
        assert!(!d.hidden_behind_group(None));

        d.group = Some(GroupId(1));
        d.show_in_group_only = true;
        assert!(d.hidden_behind_group(Some("other")));
        assert!(!d.hidden_behind_group(Some("D1")));

        d.show_in_group_only = false;
        assert!(!d.hidden_behind_group(Some("other")));
    }
}
