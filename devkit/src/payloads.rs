/*!
Payload builders shaped like the ESP32 firmware's messages.

The firmware stamps `timestamp` with `millis()`, so the builders default to a
plain integer counter; override it with `timestamp()` when a test needs a
particular document id.
*/

use serde_json::{json, Map, Value};

pub struct PayloadBuilder {
    fields: Map<String, Value>,
}

impl PayloadBuilder {
    pub fn empty() -> Self {
        Self { fields: Map::new() }
    }

    /// Sensor-data message as published on `home/sensors/data`.
    pub fn sensor_reading(device_id: &str) -> Self {
        Self::empty()
            .field("device_id", device_id)
            .field("device_type", "ESP32_HomeMonitor")
            .field("location", "living_room")
            .field("timestamp", 123_456)
            .field("uptime_seconds", 123)
            .field(
                "sensors",
                json!({
                    "air_quality_ppm": 412,
                    "water_leak": false,
                    "motion": false,
                    "light_level": 530,
                    "temperature_c": 21.5,
                    "humidity_percent": 48.0,
                    "battery_percent": 97,
                }),
            )
            .field(
                "status",
                json!({
                    "wifi_connected": true,
                    "mqtt_connected": true,
                    "rssi": -61,
                    "publish_count": 42,
                    "error_count": 0,
                }),
            )
    }

    pub fn alert(device_id: &str, alert_type: &str, severity: &str) -> Self {
        Self::empty()
            .field("device_id", device_id)
            .field("timestamp", 123_456)
            .field("alert_type", alert_type)
            .field("severity", severity)
            .field("message", format!("{alert_type} detected"))
    }

    pub fn heartbeat(device_id: &str, uptime_minutes: u64) -> Self {
        Self::empty()
            .field("device_id", device_id)
            .field("timestamp", uptime_minutes * 60_000)
            .field("uptime_minutes", uptime_minutes)
            .field("free_heap", 201_344)
            .field("wifi_rssi", -58)
            .field("publish_count", 42)
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn timestamp(self, value: impl Into<Value>) -> Self {
        self.field("timestamp", value)
    }

    /// Sets `sensors.{name}`, creating the object if needed.
    pub fn sensor(mut self, name: &str, value: impl Into<Value>) -> Self {
        let sensors = self
            .fields
            .entry("sensors")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = sensors {
            map.insert(name.to_string(), value.into());
        }
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_match_firmware_shapes() {
        let reading = PayloadBuilder::sensor_reading("esp32-1").to_value();
        assert_eq!(reading["device_id"], "esp32-1");
        assert_eq!(reading["sensors"]["temperature_c"], 21.5);

        let alert = PayloadBuilder::alert("esp32-1", "water_leak", "HIGH").to_value();
        assert_eq!(alert["message"], "water_leak detected");

        let beat = PayloadBuilder::heartbeat("esp32-1", 5).without("wifi_rssi").to_value();
        assert_eq!(beat["timestamp"], 300_000);
        assert!(beat.get("wifi_rssi").is_none());
    }

    #[test]
    fn sensor_overrides_nested_values() {
        let payload = PayloadBuilder::empty().sensor("motion", true).to_value();
        assert_eq!(payload, json!({"sensors": {"motion": true}}));
    }
}
