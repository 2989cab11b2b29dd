use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Telemetry published by a controller on `/devices/<id>/events`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TelemetryMsg {
    pub humidity: f64,
    pub pump_active: bool,
    pub light_active: bool,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Subscription filter covering every controller's telemetry.
pub const EVENTS_FILTER: &str = "/devices/+/events";

/// Extract device_id from "/devices/<device_id>/events".
pub fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4
        && parts[0].is_empty()
        && parts[1] == "devices"
        && !parts[2].is_empty()
        && parts[3] == "events"
    {
        Some(parts[2])
    } else {
        None
    }
}

/// Topic a controller listens on for parameter pushes.
pub fn config_topic(device_id: &str) -> String {
    format!("/devices/{device_id}/config")
}

/// A device id must fit in a single topic level.
pub fn valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty() && !device_id.contains(['/', '+', '#'])
}

/// Parse telemetry JSON, dropping physically impossible humidity values.
pub fn parse_telemetry(payload: &[u8]) -> Result<TelemetryMsg, String> {
    let msg: TelemetryMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad telemetry json: {e}"))?;
    if !(0.0..=100.0).contains(&msg.humidity) {
        return Err(format!(
            "humidity {} outside 0-100, dropping reading",
            msg.humidity
        ));
    }
    Ok(msg)
}

/// Controllers accept only a flat object of scalar values.
pub fn check_config_body(body: &Value) -> Result<(), String> {
    let Some(map) = body.as_object() else {
        return Err("config must be a JSON object".to_string());
    };
    if map.is_empty() {
        return Err("config must not be empty".to_string());
    }
    for (key, value) in map {
        match value {
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
            Value::Null => return Err(format!("'{key}': null is not allowed")),
            Value::Array(_) | Value::Object(_) => {
                return Err(format!("'{key}': nested values are not allowed"))
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
