use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use super::model::V1Light;
use super::model::V2Light;
use super::model::V2Response;
use super::model::v1_error;
use crate::config::HueApi;
use crate::config::HueConfig;
use crate::engine::AdapterError;
use crate::engine::BrightnessScale;
use crate::engine::Command;
use crate::engine::CommandQueueEntry;
use crate::engine::DeviceDescriptor;
use crate::engine::PowerState;
use crate::engine::StateProperties;
use crate::engine::VendorAdapter;
use crate::integrations::http;

pub const VENDOR: &str = "hue";
const APPLICATION_KEY_HEADER: &str = "hue-application-key";

/// Adapter for a Hue bridge on the local network.
///
/// The light listing already carries each light's state, so `fetch_state` reads
/// the descriptor's passthrough payload instead of calling the bridge again.
pub struct HueAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api: HueApi,
}

/// `192.168.1.20` becomes `https://192.168.1.20`; full URLs are kept.
pub fn bridge_url(bridge: &str) -> String {
    let bridge = bridge.trim().trim_end_matches('/');
    if bridge.starts_with("http://") || bridge.starts_with("https://") {
        bridge.to_string()
    } else {
        format!("https://{}", bridge)
    }
}

impl HueAdapter {
    pub fn new(config: &HueConfig, timeout: Duration) -> anyhow::Result<Self> {
        let api_key = http::credential(config.api_key.as_deref(), config.api_key_env.as_deref());
        if api_key.is_none() {
            warn!("No Hue application key configured; every Hue call will fail");
        }
        Ok(Self {
            // Bridges serve a self-signed certificate.
            client: http::client(timeout, true)?,
            base_url: bridge_url(&config.bridge),
            api_key,
            api: config.api,
        })
    }

    pub fn scale(&self) -> BrightnessScale {
        match self.api {
            HueApi::V2 => BrightnessScale::PERCENT,
            HueApi::V1 => BrightnessScale::BYTE_254,
        }
    }

    fn key(&self) -> Result<&str, AdapterError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AdapterError::unavailable(VENDOR, "no application key configured"))
    }

    fn v2_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, AdapterError> {
        let key = self.key()?;
        Ok(self
            .client
            .request(method, format!("{}/clip/v2/resource/{}", self.base_url, path))
            .header(APPLICATION_KEY_HEADER, key))
    }

    fn v1_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, AdapterError> {
        let key = self.key()?;
        Ok(self
            .client
            .request(method, format!("{}/api/{}/{}", self.base_url, key, path)))
    }

    async fn list_v2(&self) -> Result<Vec<DeviceDescriptor>, AdapterError> {
        let response: V2Response =
            http::send_json(VENDOR, self.v2_request(reqwest::Method::GET, "light")?).await?;
        if let Some(error) = response.errors.first() {
            return Err(AdapterError::unavailable(VENDOR, error.description.clone()));
        }

        let mut descriptors = Vec::with_capacity(response.data.len());
        for raw in response.data {
            match serde_json::from_value::<V2Light>(raw.clone()) {
                Ok(light) => descriptors.push(DeviceDescriptor {
                    id: light.id,
                    brand: VENDOR.to_string(),
                    model: light
                        .metadata
                        .archetype
                        .unwrap_or_else(|| "light".to_string()),
                    name: light.metadata.name,
                    raw,
                }),
                Err(e) => warn!("Skipping malformed Hue light: {}", e),
            }
        }
        Ok(descriptors)
    }

    async fn list_v1(&self) -> Result<Vec<DeviceDescriptor>, AdapterError> {
        let body: Value =
            http::send_json(VENDOR, self.v1_request(reqwest::Method::GET, "lights")?).await?;
        if let Some(error) = v1_error(&body) {
            return Err(AdapterError::unavailable(VENDOR, error));
        }
        let lights: BTreeMap<String, Value> = serde_json::from_value(body).map_err(|e| {
            AdapterError::data_invalid(VENDOR, format!("unexpected light list: {}", e))
        })?;

        let mut descriptors = Vec::with_capacity(lights.len());
        for (id, raw) in lights {
            match serde_json::from_value::<V1Light>(raw.clone()) {
                Ok(light) => descriptors.push(DeviceDescriptor {
                    id,
                    brand: VENDOR.to_string(),
                    model: light.modelid.unwrap_or_else(|| "light".to_string()),
                    name: light.name,
                    raw,
                }),
                Err(e) => warn!("Skipping malformed Hue light {}: {}", id, e),
            }
        }
        Ok(descriptors)
    }

    fn state_v2(&self, raw: &Value) -> Result<StateProperties, AdapterError> {
        let light: V2Light = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::data_invalid(VENDOR, e.to_string()))?;
        Ok(StateProperties {
            power: light.on.map(|on| PowerState::from(on.on)),
            brightness: light.dimming.map(|d| self.scale().to_percent(d.brightness)),
            // Listed lights are known to the bridge; v2 reports reachability separately.
            online: Some(true),
        })
    }

    fn state_v1(&self, raw: &Value) -> Result<StateProperties, AdapterError> {
        let light: V1Light = serde_json::from_value(raw.clone())
            .map_err(|e| AdapterError::data_invalid(VENDOR, e.to_string()))?;
        Ok(StateProperties {
            power: light.state.on.map(PowerState::from),
            brightness: light.state.bri.map(|bri| self.scale().to_percent(bri)),
            online: light.state.reachable,
        })
    }

    /// Request body for a command, in the bridge's own scale.
    pub fn command_body(&self, command: Command) -> Value {
        match (self.api, command) {
            (HueApi::V2, Command::Turn(power)) => json!({"on": {"on": power.is_on()}}),
            (HueApi::V2, Command::Brightness(b)) => {
                json!({"dimming": {"brightness": f64::from(self.scale().to_raw(b))}})
            }
            (HueApi::V1, Command::Turn(power)) => json!({"on": power.is_on()}),
            // v1 rejects bri 0.
            (HueApi::V1, Command::Brightness(b)) => json!({"bri": self.scale().to_raw(b).max(1)}),
        }
    }
}

#[async_trait]
impl VendorAdapter for HueAdapter {
    fn name(&self) -> &str {
        VENDOR
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, AdapterError> {
        let descriptors = match self.api {
            HueApi::V2 => self.list_v2().await?,
            HueApi::V1 => self.list_v1().await?,
        };
        debug!("Hue ({}) listed {} lights", self.api, descriptors.len());
        Ok(descriptors)
    }

    async fn fetch_state(&self, device: &DeviceDescriptor) -> Result<StateProperties, AdapterError> {
        match self.api {
            HueApi::V2 => self.state_v2(&device.raw),
            HueApi::V1 => self.state_v1(&device.raw),
        }
    }

    async fn apply_command(&self, entry: &CommandQueueEntry) -> Result<(), AdapterError> {
        let body = self.command_body(entry.command);
        match self.api {
            HueApi::V2 => {
                let request = self
                    .v2_request(reqwest::Method::PUT, &format!("light/{}", entry.device))?
                    .json(&body);
                let response: V2Response = http::send_json(VENDOR, request).await?;
                if let Some(error) = response.errors.first() {
                    return Err(AdapterError::unavailable(VENDOR, error.description.clone()));
                }
            }
            HueApi::V1 => {
                let request = self
                    .v1_request(reqwest::Method::PUT, &format!("lights/{}/state", entry.device))?
                    .json(&body);
                let response: Value = http::send_json(VENDOR, request).await?;
                if let Some(error) = v1_error(&response) {
                    return Err(AdapterError::unavailable(VENDOR, error));
                }
            }
        }
        debug!(device = %entry.device, "Sent {}", entry.command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_json;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;
    use crate::engine::Brightness;
    use crate::engine::CommandStatus;
    use crate::engine::EntryId;

    fn adapter(server: &MockServer, api: HueApi) -> HueAdapter {
        HueAdapter::new(
            &HueConfig {
                bridge: server.uri(),
                api_key: Some("appkey".to_string()),
                api_key_env: None,
                api,
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn entry(device: &str, command: Command) -> CommandQueueEntry {
        CommandQueueEntry {
            id: EntryId(7),
            device: device.to_string(),
            model: "sultan_bulb".to_string(),
            brand: VENDOR.to_string(),
            command,
            status: CommandStatus::Processing,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_bridge_url() {
        assert_eq!(bridge_url("192.168.1.20"), "https://192.168.1.20");
        assert_eq!(bridge_url("http://localhost:8080/"), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_scales_round_trip_through_commands() {
        let server = MockServer::start().await;
        for api in [HueApi::V2, HueApi::V1] {
            let hue = adapter(&server, api);
            for pct in 1..=Brightness::MAX {
                let b = Brightness::new(pct).unwrap();
                let body = hue.command_body(Command::Brightness(b));
                let raw = match api {
                    HueApi::V2 => body["dimming"]["brightness"].as_f64().unwrap(),
                    HueApi::V1 => body["bri"].as_f64().unwrap(),
                };
                assert_eq!(hue.scale().to_percent(raw), b, "{} at {}%", api, pct);
            }
        }
    }

    #[tokio::test]
    async fn test_v2_list_and_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip/v2/resource/light"))
            .and(header("hue-application-key", "appkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [],
                "data": [
                    {
                        "id": "3f1c",
                        "type": "light",
                        "metadata": {"name": "Hall", "archetype": "sultan_bulb"},
                        "on": {"on": true},
                        "dimming": {"brightness": 49.8},
                        "color_temperature": {"mirek": 366}
                    },
                    {
                        "id": "9a00",
                        "metadata": {"name": "Strip"},
                        "on": {"on": false}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let hue = adapter(&server, HueApi::V2);
        let lights = hue.list_devices().await.unwrap();
        assert_eq!(lights.len(), 2);
        assert_eq!(lights[0].model, "sultan_bulb");
        assert_eq!(lights[1].model, "light");

        let state = hue.fetch_state(&lights[0]).await.unwrap();
        assert_eq!(state.power, Some(PowerState::On));
        assert_eq!(state.brightness, Some(Brightness::saturating(50)));
        assert_eq!(state.online, Some(true));

        let state = hue.fetch_state(&lights[1]).await.unwrap();
        assert_eq!(state.power, Some(PowerState::Off));
        assert_eq!(state.brightness, None);

        // State comes from the listing; only the list call hit the bridge.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_v1_list_and_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/appkey/lights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "1": {
                    "name": "Porch",
                    "modelid": "LCT015",
                    "state": {"on": true, "bri": 127, "ct": 366, "reachable": false}
                }
            })))
            .mount(&server)
            .await;

        let hue = adapter(&server, HueApi::V1);
        let lights = hue.list_devices().await.unwrap();
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].id, "1");
        assert_eq!(lights[0].model, "LCT015");

        let state = hue.fetch_state(&lights[0]).await.unwrap();
        assert_eq!(state.power, Some(PowerState::On));
        assert_eq!(state.brightness, Some(Brightness::saturating(50)));
        assert_eq!(state.online, Some(false));
    }

    #[tokio::test]
    async fn test_v1_unauthorized_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/appkey/lights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"error": {"type": 1, "address": "/lights", "description": "unauthorized user"}}
            ])))
            .mount(&server)
            .await;

        let err = adapter(&server, HueApi::V1).list_devices().await.unwrap_err();
        assert_eq!(err, AdapterError::unavailable(VENDOR, "unauthorized user"));
    }

    #[tokio::test]
    async fn test_v2_apply_command() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/clip/v2/resource/light/3f1c"))
            .and(body_json(json!({"on": {"on": false}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [],
                "data": [{"rid": "3f1c", "rtype": "light"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server, HueApi::V2)
            .apply_command(&entry("3f1c", Command::Turn(PowerState::Off)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_v1_apply_brightness_never_sends_zero() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/appkey/lights/1/state"))
            .and(body_json(json!({"bri": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"success": {"/lights/1/state/bri": 1}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server, HueApi::V1)
            .apply_command(&entry("1", Command::Brightness(Brightness::saturating(0))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bridge_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip/v2/resource/light"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server, HueApi::V2).list_devices().await.unwrap_err();
        assert_eq!(err, AdapterError::unavailable(VENDOR, "HTTP 503"));
    }
}
