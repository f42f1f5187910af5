use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::TransmitError;
use crate::net::ControllerClient;
use crate::types::{Ack, Heartbeat, LatestValue, LatestValues, ResponsePayload, TelemetrySample};

type Validator = Box<dyn Fn(f64) -> bool>;

/// Sends readings and heartbeats. One attempt each; a failed sample is dropped and the next
/// wake cycle is the retry.
pub struct TelemetryReporter {
    client: ControllerClient,
    identity: String,
    sensor_timeout: Duration,
    ping_timeout: Duration,
    latest: LatestValues,
    validators: HashMap<String, Validator>,
}

impl TelemetryReporter {
    pub fn new(
        client: ControllerClient,
        identity: impl Into<String>,
        sensor_timeout: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            client,
            identity: identity.into(),
            sensor_timeout,
            ping_timeout,
            latest: LatestValues::default(),
            validators: HashMap::new(),
        }
    }

    pub fn client(&self) -> &ControllerClient {
        &self.client
    }

    pub fn latest_values(&self) -> &LatestValues {
        &self.latest
    }

    /// Readings for `label` that fail `accept` are never sent.
    pub fn set_validator<F>(&mut self, label: impl Into<String>, accept: F)
    where
        F: Fn(f64) -> bool + 'static,
    {
        self.validators.insert(label.into(), Box::new(accept));
    }

    pub async fn post(&mut self, label: &str, value: f64, vcc: f32) -> Result<Ack, TransmitError> {
        if let Some(accept) = self.validators.get(label) {
            if !accept(value) {
                warn!(label, value, "Reading rejected by validator");
                return Err(TransmitError::Rejected {
                    label: label.to_string(),
                    value,
                });
            }
        }

        let sample = TelemetrySample {
            id: self.identity.clone(),
            label: label.to_string(),
            value,
            vcc,
        };
        let url = self.client.endpoint(&[
            "esp",
            "sensor",
            "set",
            &sample.id,
            &sample.label,
            &format!("{:.2}", value),
            &format!("{:.2}", vcc),
        ]);

        match self.client.post_json(url, &sample, self.sensor_timeout).await {
            Ok(body) => {
                debug!(label, value, response = %body, "Reading delivered");
                self.latest.record(
                    label,
                    LatestValue {
                        value,
                        vcc,
                        updated_at: Utc::now(),
                    },
                );
                Ok(Ack {
                    label: sample.label,
                    value,
                    acknowledged_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(label, value, error = %e, "Reading dropped");
                Err(e)
            }
        }
    }

    /// Liveness and version report. Any failure reads as "no reply".
    pub async fn ping(
        &self,
        free_memory: u64,
        vcc: f32,
        version: u32,
        address: Option<IpAddr>,
    ) -> Option<ResponsePayload> {
        let heartbeat = Heartbeat {
            ip: address.map(|ip| ip.to_string()).unwrap_or_default(),
            free_heap: free_memory,
            vcc,
            version,
        };
        let url = self.client.endpoint(&["esp", "ping", &self.identity]);

        match self.client.post_json(url, &heartbeat, self.ping_timeout).await {
            Ok(body) => {
                info!(response = %body, "Heartbeat sent");
                Some(ResponsePayload(body))
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat failed");
                None
            }
        }
    }
}
