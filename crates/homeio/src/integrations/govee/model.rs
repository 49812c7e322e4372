//! Govee developer API payloads.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::engine::Command;

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<Value>,
}

/// The fields of a listed device we rely on. The rest is kept as passthrough.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedDevice {
    pub device: String,
    pub model: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub properties: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct ControlRequest<'a> {
    pub device: &'a str,
    pub model: &'a str,
    pub cmd: Command,
}
