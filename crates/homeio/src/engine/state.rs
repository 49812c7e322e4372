use serde::Deserialize;
use serde::Serialize;

use super::device::Brightness;
use super::device::Device;
use super::device::PowerState;

/// State of a device as reported by a vendor, already in canonical units.
///
/// Every field is optional: an adapter only fills in what the vendor reported, and
/// fields left as `None` keep their last observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateProperties {
    pub power: Option<PowerState>,
    pub brightness: Option<Brightness>,
    pub online: Option<bool>,
}

impl StateProperties {
    /// Write the observed values onto the device's `actual_*` side.
    pub fn apply_to(&self, device: &mut Device) {
        if let Some(power) = self.power {
            device.actual_power = Some(power);
        }
        if let Some(brightness) = self.brightness {
            device.actual_brightness = Some(brightness);
        }
        if let Some(online) = self.online {
            device.online = online;
        }
    }
}

/// Linear mapping between a vendor's raw brightness range `0..=max` and the
/// canonical percentage.
///
/// `to_raw` followed by `to_percent` is the identity for every percentage as long
/// as `max >= 100`, so a converged device never reads back as divergent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrightnessScale {
    max: u16,
}

impl BrightnessScale {
    /// Vendors that already speak percent (Govee, Hue CLIP v2).
    pub const PERCENT: BrightnessScale = BrightnessScale { max: 100 };

    /// Hue v1 `bri` and other 8-bit dimmers.
    pub const BYTE_254: BrightnessScale = BrightnessScale { max: 254 };

    /// Convert a raw vendor value, clamping anything out of range.
    pub fn to_percent(&self, raw: f64) -> Brightness {
        if !raw.is_finite() || self.max == 0 {
            return Brightness::saturating(0);
        }
        let pct = raw.clamp(0.0, f64::from(self.max)) * 100.0 / f64::from(self.max);
        Brightness::saturating(pct.round() as i64)
    }

    pub fn to_raw(&self, brightness: Brightness) -> u16 {
        let raw = f64::from(brightness.percent()) * f64::from(self.max) / 100.0;
        raw.round() as u16
    }
}
