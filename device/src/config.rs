use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// How the node spends the time between operational cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerMode {
    DeepSleep,
    SleepDelay,
    AlwaysOn,
    LightSleep,
}

impl PowerMode {
    /// Modes in which the node stays powered long enough to answer inbound commands.
    pub fn serves_commands(self) -> bool {
        matches!(self, PowerMode::SleepDelay | PowerMode::AlwaysOn)
    }

    /// Modes that heartbeat from the main loop rather than only at boot.
    pub fn heartbeats_on_tick(self) -> bool {
        matches!(self, PowerMode::SleepDelay | PowerMode::LightSleep)
    }
}

impl TryFrom<i64> for PowerMode {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PowerMode::DeepSleep),
            1 => Ok(PowerMode::SleepDelay),
            2 => Ok(PowerMode::AlwaysOn),
            3 => Ok(PowerMode::LightSleep),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub passphrase: String,
}

/// Runtime configuration for one boot. Never mutated after `parse`.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub identity: String,
    pub app_name: Option<String>,
    pub api_base: Url,
    pub credentials: Credentials,
    pub power_mode: PowerMode,
    pub rest_interval_secs: i64,
    pub firmware_version: u32,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    id: Option<String>,
    #[serde(rename = "iotApp")]
    iot_app: Option<String>,
    #[serde(rename = "apiUrl")]
    api_url: Option<String>,
    version: Option<u32>,
    #[serde(alias = "ESP8266Form")]
    wifi: Option<RawCredentials>,
    options: Option<RawOptions>,
}

#[derive(Debug, Deserialize)]
struct RawCredentials {
    ssid: Option<String>,
    passphrase: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    powered_mode: Option<i64>,
    timer: Option<i64>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingField(field)),
    }
}

impl DeviceConfig {
    /// Parses the JSON configuration text. All or nothing.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        let identity = required(raw.id, "id")?;
        let api_url = required(raw.api_url, "apiUrl")?;
        let firmware_version = raw.version.ok_or(ConfigError::MissingField("version"))?;
        let wifi = raw.wifi.ok_or(ConfigError::MissingField("wifi"))?;
        let ssid = required(wifi.ssid, "wifi.ssid")?;
        let options = raw.options.ok_or(ConfigError::MissingField("options"))?;
        let mode_code = options
            .powered_mode
            .ok_or(ConfigError::MissingField("options.poweredMode"))?;
        let rest_interval_secs = options
            .timer
            .ok_or(ConfigError::MissingField("options.timer"))?;

        let power_mode = PowerMode::try_from(mode_code).map_err(|code| ConfigError::InvalidField {
            field: "options.poweredMode",
            reason: format!("unknown power mode code {code}"),
        })?;

        let api_base = Url::parse(api_url.trim()).map_err(|e| ConfigError::InvalidField {
            field: "apiUrl",
            reason: e.to_string(),
        })?;
        if api_base.cannot_be_a_base() || !matches!(api_base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidField {
                field: "apiUrl",
                reason: format!("`{api_base}` is not an http(s) base URL"),
            });
        }

        Ok(DeviceConfig {
            identity,
            app_name: raw.iot_app.filter(|name| !name.trim().is_empty()),
            api_base,
            credentials: Credentials {
                ssid,
                passphrase: wifi.passphrase.unwrap_or_default(),
            },
            power_mode,
            rest_interval_secs,
            firmware_version,
        })
    }

    /// Name announced on the network, `{iotApp}-{id}`.
    pub fn hostname(&self) -> String {
        let app = self.app_name.as_deref().unwrap_or("device-agent");
        format!("{}-{}", app, self.identity)
    }

    pub fn config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("device_config.json")
    }

    /// Reads and parses the configuration file. A file that cannot be read is as unusable as
    /// one that cannot be parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw)
    }
}

/// Local policy and platform capabilities. Not part of the controller's configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub state_db_path: PathBuf,
    pub host_state_dir: PathBuf,
    pub hardware_sleep_budget_secs: u64,
    pub connect_budget: Duration,
    pub connect_poll_interval: Duration,
    pub connect_retry_secs: u64,
    pub sensor_timeout: Duration,
    pub ping_timeout: Duration,
    pub firmware_timeout: Duration,
    pub command_listen_addr: String,
    pub command_reply_timeout: Duration,
    pub idle_poll_interval: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            state_db_path: PathBuf::from("./agent_state.db"),
            host_state_dir: PathBuf::from("."),
            hardware_sleep_budget_secs: 4200,
            connect_budget: Duration::from_secs(15),
            connect_poll_interval: Duration::from_millis(500),
            connect_retry_secs: 30,
            sensor_timeout: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            firmware_timeout: Duration::from_secs(120),
            command_listen_addr: "0.0.0.0:8080".to_string(),
            command_reply_timeout: Duration::from_millis(5000),
            idle_poll_interval: Duration::from_millis(250),
        }
    }
}

impl AgentSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            state_db_path: env::var("STATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_db_path),
            host_state_dir: env::var("HOST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.host_state_dir),
            hardware_sleep_budget_secs: get_env_var_u64(
                "HARDWARE_SLEEP_BUDGET_SECS",
                defaults.hardware_sleep_budget_secs,
            ),
            connect_budget: Duration::from_millis(get_env_var_u64("CONNECT_BUDGET_MS", 15_000)),
            connect_poll_interval: Duration::from_millis(get_env_var_u64("CONNECT_POLL_MS", 500)),
            connect_retry_secs: get_env_var_u64("CONNECT_RETRY_SECS", defaults.connect_retry_secs),
            sensor_timeout: Duration::from_secs(get_env_var_u64("HTTP_SENSOR_TIMEOUT_SECS", 20)),
            ping_timeout: Duration::from_secs(get_env_var_u64("HTTP_PING_TIMEOUT_SECS", 10)),
            firmware_timeout: Duration::from_secs(get_env_var_u64("HTTP_FIRMWARE_TIMEOUT_SECS", 120)),
            command_listen_addr: env::var("COMMAND_LISTEN_ADDR")
                .unwrap_or(defaults.command_listen_addr),
            command_reply_timeout: Duration::from_millis(get_env_var_u64(
                "COMMAND_REPLY_TIMEOUT_MS",
                5000,
            )),
            idle_poll_interval: Duration::from_millis(get_env_var_u64("IDLE_POLL_MS", 250)),
        }
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
