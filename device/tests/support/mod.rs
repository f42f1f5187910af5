// Shared fixtures for the integration tests: an in-process controller and config helpers.
#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use device_agent::AgentSettings;

#[derive(Debug, Clone)]
pub enum FirmwareBehavior {
    Image(Vec<u8>),
    NoUpdate,
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct ControllerBehavior {
    pub advertised_version: Option<u32>,
    pub ping_status: u16,
    pub sensor_status: u16,
    pub sensor_delay: Option<Duration>,
    pub firmware: FirmwareBehavior,
}

impl Default for ControllerBehavior {
    fn default() -> Self {
        Self {
            advertised_version: None,
            ping_status: 200,
            sensor_status: 200,
            sensor_delay: None,
            firmware: FirmwareBehavior::NoUpdate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl RecordedCall {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Clone, Default)]
struct Shared {
    behavior: Arc<Mutex<ControllerBehavior>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

/// Speaks the controller side of the device protocol under `/api`.
pub struct FakeController {
    addr: std::net::SocketAddr,
    shared: Shared,
}

impl FakeController {
    pub async fn start(behavior: ControllerBehavior) -> Self {
        let shared = Shared {
            behavior: Arc::new(Mutex::new(behavior)),
            calls: Arc::default(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(answer).with_state(shared.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });
        Self { addr, shared }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/", self.addr)
    }

    pub fn update(&self, change: impl FnOnce(&mut ControllerBehavior)) {
        change(&mut self.shared.behavior.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, prefix: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.path.starts_with(prefix))
            .collect()
    }
}

async fn answer(State(shared): State<Shared>, method: axum::http::Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().strip_prefix("/api").unwrap_or(uri.path()).to_string();
    shared.calls.lock().unwrap().push(RecordedCall {
        method: method.to_string(),
        path: path.clone(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    let behavior = shared.behavior.lock().unwrap().clone();

    if path.starts_with("/esp/ping/") {
        if behavior.ping_status != 200 {
            return status(behavior.ping_status);
        }
        return match behavior.advertised_version {
            Some(version) => format!(r#"{{"version": {version}}}"#).into_response(),
            None => "{}".into_response(),
        };
    }
    if path.starts_with("/esp/sensor/set/") {
        if let Some(delay) = behavior.sensor_delay {
            tokio::time::sleep(delay).await;
        }
        if behavior.sensor_status != 200 {
            return status(behavior.sensor_status);
        }
        return "{}".into_response();
    }
    if path.starts_with("/esp/firmware/upgrade/") {
        return match behavior.firmware {
            FirmwareBehavior::Image(image) => image.into_response(),
            FirmwareBehavior::NoUpdate => status(304),
            FirmwareBehavior::Status(code) => status(code),
        };
    }
    status(404)
}

fn status(code: u16) -> Response {
    StatusCode::from_u16(code).unwrap().into_response()
}

/// An API URL nobody listens on.
pub async fn unreachable_api_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/api/")
}

pub fn config_json(api_url: &str, powered_mode: u8, timer: i64, version: u32) -> String {
    format!(
        r#"{{
            "id": "node-7",
            "iotApp": "test-sensor",
            "apiUrl": "{api_url}",
            "version": {version},
            "wifi": {{ "ssid": "lab", "passphrase": "hunter2" }},
            "options": {{ "poweredMode": {powered_mode}, "timer": {timer} }}
        }}"#
    )
}

pub fn test_settings() -> AgentSettings {
    AgentSettings {
        hardware_sleep_budget_secs: 4200,
        connect_budget: Duration::from_millis(30),
        connect_poll_interval: Duration::from_millis(10),
        connect_retry_secs: 30,
        sensor_timeout: Duration::from_secs(2),
        ping_timeout: Duration::from_secs(2),
        firmware_timeout: Duration::from_secs(2),
        idle_poll_interval: Duration::from_millis(200),
        ..AgentSettings::default()
    }
}

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}
