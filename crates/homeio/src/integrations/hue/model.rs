//! Hue bridge payloads for CLIP v2 and the legacy v1 API.

use serde::Deserialize;
use serde_json::Value;

/// `GET /clip/v2/resource/light`
#[derive(Debug, Deserialize)]
pub struct V2Response {
    #[serde(default)]
    pub errors: Vec<V2Error>,
    #[serde(default)]
    pub data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct V2Error {
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct V2Light {
    pub id: String,
    pub metadata: V2Metadata,
    #[serde(default)]
    pub on: Option<V2On>,
    #[serde(default)]
    pub dimming: Option<V2Dimming>,
}

#[derive(Debug, Deserialize)]
pub struct V2Metadata {
    pub name: String,
    #[serde(default)]
    pub archetype: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct V2On {
    pub on: bool,
}

#[derive(Debug, Deserialize)]
pub struct V2Dimming {
    pub brightness: f64,
}

/// One entry of the v1 `lights` map. The map key is the light id.
#[derive(Debug, Deserialize)]
pub struct V1Light {
    pub name: String,
    #[serde(default)]
    pub modelid: Option<String>,
    #[serde(default)]
    pub state: V1State,
}

#[derive(Debug, Default, Deserialize)]
pub struct V1State {
    #[serde(default)]
    pub on: Option<bool>,
    #[serde(default)]
    pub bri: Option<f64>,
    #[serde(default)]
    pub reachable: Option<bool>,
}

/// The v1 API answers errors with HTTP 200 and a body like
/// `[{"error": {"type": 1, "description": "unauthorized user"}}]`.
pub fn v1_error(body: &Value) -> Option<String> {
    body.as_array()?.iter().find_map(|item| {
        let error = item.get("error")?;
        Some(
            error
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_v1_error_detection() {
        let body = json!([{"error": {"type": 1, "address": "/", "description": "unauthorized user"}}]);
        assert_eq!(v1_error(&body).as_deref(), Some("unauthorized user"));
        assert_eq!(v1_error(&json!([{"success": {"/lights/1/state/on": true}}])), None);
        assert_eq!(v1_error(&json!({"1": {}})), None);
    }
}
