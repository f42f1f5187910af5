use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One reading on its way to the controller.
#[derive(Serialize, Debug, Clone)]
pub struct TelemetrySample {
    pub id: String,
    #[serde(rename = "type")]
    pub label: String,
    pub value: f64,
    pub vcc: f32,
}

// For the ping endpoint
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub ip: String,
    pub free_heap: u64,
    pub vcc: f32,
    pub version: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HeartbeatReply {
    pub version: Option<i64>,
}

#[derive(Serialize, Debug, Clone)]
pub struct FirmwareRequest<'a> {
    pub id: &'a str,
    pub version: u32,
}

/// Raw body of a ping reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload(pub String);

impl ResponsePayload {
    /// The firmware version the controller advertises, if the body carries a usable one.
    pub fn advertised_version(&self) -> Option<u32> {
        let reply: HeartbeatReply = serde_json::from_str(&self.0).ok()?;
        reply.version.and_then(|v| u32::try_from(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub label: String,
    pub value: f64,
    pub acknowledged_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LatestValue {
    pub value: f64,
    pub vcc: f32,
    pub updated_at: DateTime<Utc>,
}

/// Last delivered value per label, for diagnostics.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct LatestValues(BTreeMap<String, LatestValue>);

impl LatestValues {
    pub fn get(&self, label: &str) -> Option<&LatestValue> {
        self.0.get(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn record(&mut self, label: &str, value: LatestValue) {
        self.0.insert(label.to_string(), value);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
