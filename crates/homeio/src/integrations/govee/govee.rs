use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::model::ControlRequest;
use super::model::DeviceList;
use super::model::DeviceState;
use super::model::Envelope;
use super::model::ListedDevice;
use crate::config::GoveeConfig;
use crate::engine::AdapterError;
use crate::engine::BrightnessScale;
use crate::engine::CommandQueueEntry;
use crate::engine::DeviceDescriptor;
use crate::engine::PowerState;
use crate::engine::StateProperties;
use crate::engine::VendorAdapter;
use crate::integrations::http;

pub const VENDOR: &str = "govee";
const DEFAULT_BASE_URL: &str = "https://developer-api.govee.com";
const API_KEY_HEADER: &str = "Govee-API-Key";

/// Govee already reports brightness as a percentage.
pub const SCALE: BrightnessScale = BrightnessScale::PERCENT;

/// Adapter for the Govee cloud API.
///
/// The API is rate limited per key, so this adapter sits out quick cycles.
pub struct GoveeAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GoveeAdapter {
    pub fn new(config: &GoveeConfig, timeout: Duration) -> anyhow::Result<Self> {
        let api_key = http::credential(config.api_key.as_deref(), config.api_key_env.as_deref());
        if api_key.is_none() {
            warn!("No Govee API key configured; every Govee call will fail");
        }
        Ok(Self {
            client: http::client(timeout, false)?,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, AdapterError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AdapterError::unavailable(VENDOR, "no API key configured"))?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(API_KEY_HEADER, key))
    }
}

fn descriptor(raw: Value) -> Result<DeviceDescriptor, serde_json::Error> {
    let listed: ListedDevice = serde_json::from_value(raw.clone())?;
    Ok(DeviceDescriptor {
        name: listed.device_name.unwrap_or_else(|| listed.device.clone()),
        id: listed.device,
        brand: VENDOR.to_string(),
        model: listed.model,
        raw,
    })
}

fn invalid(reason: impl Into<String>) -> AdapterError {
    AdapterError::data_invalid(VENDOR, reason)
}

/// Convert Govee's property list (`[{"online": true}, {"powerState": "on"}, ...]`).
///
/// Properties we do not model (colour, colour temperature) are ignored.
pub fn parse_properties(
    properties: &[serde_json::Map<String, Value>],
) -> Result<StateProperties, AdapterError> {
    let mut state = StateProperties::default();
    for (key, value) in properties.iter().flatten() {
        match key.as_str() {
            "online" => {
                state.online = Some(match value {
                    Value::Bool(b) => *b,
                    Value::String(s) if s == "true" => true,
                    Value::String(s) if s == "false" => false,
                    other => return Err(invalid(format!("online is {}", other))),
                });
            }
            "powerState" => {
                let power = value
                    .as_str()
                    .and_then(|s| s.parse::<PowerState>().ok())
                    .ok_or_else(|| invalid(format!("powerState is {}", value)))?;
                state.power = Some(power);
            }
            "brightness" => {
                let raw = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("brightness is {}", value)))?;
                state.brightness = Some(SCALE.to_percent(raw));
            }
            _ => {}
        }
    }
    Ok(state)
}

#[async_trait]
impl VendorAdapter for GoveeAdapter {
    fn name(&self) -> &str {
        VENDOR
    }

    fn poll_on_quick(&self) -> bool {
        false
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, AdapterError> {
        let envelope: Envelope<DeviceList> =
            http::send_json(VENDOR, self.request(reqwest::Method::GET, "/v1/devices")?).await?;
        let list = envelope.data.ok_or_else(|| {
            invalid(format!(
                "device list has no data ({})",
                envelope.message.as_deref().unwrap_or("no message")
            ))
        })?;

        let mut descriptors = Vec::with_capacity(list.devices.len());
        for raw in list.devices {
            match descriptor(raw) {
                Ok(d) => descriptors.push(d),
                Err(e) => warn!("Skipping malformed Govee device: {}", e),
            }
        }
        debug!("Govee listed {} devices", descriptors.len());
        Ok(descriptors)
    }

    async fn fetch_state(&self, device: &DeviceDescriptor) -> Result<StateProperties, AdapterError> {
        let request = self
            .request(reqwest::Method::GET, "/v1/devices/state")?
            .query(&[("device", device.id.as_str()), ("model", device.model.as_str())]);
        let envelope: Envelope<DeviceState> = http::send_json(VENDOR, request).await?;
        let data = envelope
            .data
            .ok_or_else(|| invalid(format!("no state for {}", device.id)))?;
        parse_properties(&data.properties)
    }

    async fn apply_command(&self, entry: &CommandQueueEntry) -> Result<(), AdapterError> {
        let body = ControlRequest {
            device: &entry.device,
            model: &entry.model,
            cmd: entry.command,
        };
        let request = self
            .request(reqwest::Method::PUT, "/v1/devices/control")?
            .json(&body);
        http::send(VENDOR, request).await?;
        debug!(device = %entry.device, "Sent {}", entry.command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_json;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;

    use super::*;
    use crate::engine::Brightness;
    use crate::engine::Command;
    use crate::engine::CommandStatus;
    use crate::engine::EntryId;

    fn adapter(server: &MockServer, key: Option<&str>) -> GoveeAdapter {
        GoveeAdapter::new(
            &GoveeConfig {
                api_key: key.map(str::to_string),
                api_key_env: None,
                base_url: Some(server.uri()),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_properties() {
        let props = json!([
            {"online": "true"},
            {"powerState": "off"},
            {"brightness": 82},
            {"colorTem": 3000}
        ]);
        let props: Vec<serde_json::Map<String, Value>> = serde_json::from_value(props).unwrap();
        let state = parse_properties(&props).unwrap();
        assert_eq!(state.online, Some(true));
        assert_eq!(state.power, Some(PowerState::Off));
        assert_eq!(state.brightness, Some(Brightness::saturating(82)));

        let bad: Vec<serde_json::Map<String, Value>> =
            serde_json::from_value(json!([{"powerState": 1}])).unwrap();
        assert!(matches!(
            parse_properties(&bad),
            Err(AdapterError::DataInvalid { .. })
        ));
    }

    #[test]
    fn test_scale_round_trip() {
        for pct in 0..=Brightness::MAX {
            let b = Brightness::new(pct).unwrap();
            assert_eq!(SCALE.to_percent(f64::from(SCALE.to_raw(b))), b);
        }
    }

    #[tokio::test]
    async fn test_list_and_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("Govee-API-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "Success",
                "data": {"devices": [
                    {"device": "AA:BB", "model": "H6008", "deviceName": "Desk", "controllable": true},
                    {"model": "broken"}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .and(query_param("device", "AA:BB"))
            .and(query_param("model", "H6008"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "device": "AA:BB",
                    "model": "H6008",
                    "properties": [{"online": true}, {"powerState": "on"}, {"brightness": 40}]
                }
            })))
            .mount(&server)
            .await;

        let govee = adapter(&server, Some("secret"));
        let devices = govee.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "AA:BB");
        assert_eq!(devices[0].name, "Desk");
        assert_eq!(devices[0].raw["controllable"], json!(true));

        let state = govee.fetch_state(&devices[0]).await.unwrap();
        assert_eq!(state.power, Some(PowerState::On));
        assert_eq!(state.brightness, Some(Brightness::saturating(40)));
    }

    #[tokio::test]
    async fn test_http_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = adapter(&server, Some("wrong")).list_devices().await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { .. }));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_calling_out() {
        let server = MockServer::start().await;
        let err = adapter(&server, None).list_devices().await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::unavailable(VENDOR, "no API key configured")
        );
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_command_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/devices/control"))
            .and(body_json(json!({
                "device": "AA:BB",
                "model": "H6008",
                "cmd": {"name": "brightness", "value": 55}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 200})))
            .expect(1)
            .mount(&server)
            .await;

        let entry = CommandQueueEntry {
            id: EntryId(1),
            device: "AA:BB".to_string(),
            model: "H6008".to_string(),
            brand: VENDOR.to_string(),
            command: Command::Brightness(Brightness::saturating(55)),
            status: CommandStatus::Processing,
            created_at: Utc::now(),
        };
        adapter(&server, Some("secret"))
            .apply_command(&entry)
            .await
            .unwrap();
    }
}
