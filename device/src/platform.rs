use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;

use crate::config::{Credentials, PowerMode};
use crate::error::UpdateApplyError;
use crate::simulate;

const BOOT_MARKER_FILE: &str = "boot_marker.json";
const SLOT_STATE_FILE: &str = "slot_state.json";
const FIRMWARE_DIR: &str = "firmware";

/// Why the current boot began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetCause {
    PowerOn,
    HardwareWatchdog,
    Exception,
    SoftwareWatchdog,
    SoftwareRestart,
    DeepSleepAwake,
    ExternalReset,
    Unknown,
}

impl ResetCause {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ResetCause::PowerOn,
            1 => ResetCause::HardwareWatchdog,
            2 => ResetCause::Exception,
            3 => ResetCause::SoftwareWatchdog,
            4 => ResetCause::SoftwareRestart,
            5 => ResetCause::DeepSleepAwake,
            6 => ResetCause::ExternalReset,
            _ => ResetCause::Unknown,
        }
    }

    pub fn is_sleep_wake(self) -> bool {
        self == ResetCause::DeepSleepAwake
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartKind {
    /// Orderly software restart.
    Reboot,
    /// Hard reset, as from the reset line.
    Reset,
}

/// What happened to control flow after a hardware sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepResult {
    Resumed,
    /// The device reset; control continues at the next boot.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Hardware capabilities the agent needs from the board.
#[async_trait(?Send)]
pub trait Platform {
    fn reset_cause(&self) -> ResetCause;

    /// Longest single hardware sleep, in seconds.
    fn hardware_sleep_budget(&self) -> u64;

    async fn sleep(&mut self, mode: PowerMode, seconds: u64) -> SleepResult;

    fn restart(&mut self, kind: RestartKind);

    fn free_memory(&self) -> u64;

    fn supply_voltage(&self) -> f32;

    fn install_firmware(&mut self, image: &[u8]) -> Result<(), UpdateApplyError>;
}

/// The network interface.
#[async_trait(?Send)]
pub trait NetworkLink {
    async fn begin(&mut self, credentials: &Credentials, hostname: &str);

    async fn status(&mut self) -> LinkStatus;

    fn local_addr(&self) -> Option<IpAddr>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct BootMarker {
    cause: ResetCause,
}

/// A/B firmware slots on the host.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlotState {
    pub active_slot: String,
    pub installs: u32,
}

impl SlotState {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SLOT_STATE_FILE);
        if path.exists() {
            let file_content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let state: SlotState = serde_json::from_str(&file_content)?;
            Ok(state)
        } else {
            Ok(SlotState {
                active_slot: "A".to_string(),
                installs: 0,
            })
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let file_content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(SLOT_STATE_FILE), file_content)?;
        Ok(())
    }

    pub fn inactive_slot(&self) -> &'static str {
        if self.active_slot == "A" {
            "B"
        } else {
            "A"
        }
    }
}

/// Runs the agent as a supervised host process.
///
/// A reset is the process exiting; the marker file written beforehand tells the next
/// process why it was started.
#[derive(Debug)]
pub struct HostPlatform {
    state_dir: PathBuf,
    sleep_budget_secs: u64,
    reset_cause: ResetCause,
}

impl HostPlatform {
    pub fn new(state_dir: impl Into<PathBuf>, sleep_budget_secs: u64) -> Self {
        let state_dir = state_dir.into();
        let marker_path = state_dir.join(BOOT_MARKER_FILE);
        let reset_cause = fs::read_to_string(&marker_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<BootMarker>(&raw).ok())
            .map(|marker| marker.cause)
            .unwrap_or(ResetCause::PowerOn);
        if marker_path.exists() {
            if let Err(e) = fs::remove_file(&marker_path) {
                log::warn!("Could not clear boot marker: {}", e);
            }
        }
        log::info!("Host platform started, reset cause {:?}", reset_cause);
        Self {
            state_dir,
            sleep_budget_secs,
            reset_cause,
        }
    }

    fn leave_marker(&self, cause: ResetCause) {
        let write = || -> Result<()> {
            fs::create_dir_all(&self.state_dir)?;
            let contents = serde_json::to_string(&BootMarker { cause })?;
            fs::write(self.state_dir.join(BOOT_MARKER_FILE), contents)?;
            Ok(())
        };
        if let Err(e) = write() {
            log::error!("Failed to write boot marker: {:#}", e);
        }
    }

    fn write_image(&self, image: &[u8]) -> Result<String> {
        let mut slots = SlotState::load(&self.state_dir)?;
        let target = slots.inactive_slot();
        let firmware_dir = self.state_dir.join(FIRMWARE_DIR);
        fs::create_dir_all(&firmware_dir)?;
        let file_path = firmware_dir.join(format!("slot_{}.bin", target));
        fs::write(&file_path, image)
            .with_context(|| format!("writing {}", file_path.display()))?;

        slots.active_slot = target.to_string();
        slots.installs += 1;
        slots.save(&self.state_dir)?;
        Ok(slots.active_slot)
    }
}

#[async_trait(?Send)]
impl Platform for HostPlatform {
    fn reset_cause(&self) -> ResetCause {
        self.reset_cause
    }

    fn hardware_sleep_budget(&self) -> u64 {
        self.sleep_budget_secs
    }

    async fn sleep(&mut self, mode: PowerMode, seconds: u64) -> SleepResult {
        match mode {
            PowerMode::AlwaysOn => SleepResult::Resumed,
            PowerMode::DeepSleep => {
                log::info!("Entering deep sleep for {}s", seconds);
                time::sleep(Duration::from_secs(seconds)).await;
                // A sleep cut short leaves no marker and the next boot reads PowerOn.
                self.leave_marker(ResetCause::DeepSleepAwake);
                SleepResult::Reset
            }
            PowerMode::SleepDelay | PowerMode::LightSleep => {
                log::info!("Resting ({:?}) for {}s", mode, seconds);
                time::sleep(Duration::from_secs(seconds)).await;
                SleepResult::Resumed
            }
        }
    }

    fn restart(&mut self, kind: RestartKind) {
        let cause = match kind {
            RestartKind::Reboot => ResetCause::SoftwareRestart,
            RestartKind::Reset => ResetCause::ExternalReset,
        };
        log::info!("Restart requested ({:?})", kind);
        self.leave_marker(cause);
    }

    fn free_memory(&self) -> u64 {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| {
                meminfo
                    .lines()
                    .find(|line| line.starts_with("MemAvailable:"))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    }

    fn supply_voltage(&self) -> f32 {
        simulate::supply_voltage()
    }

    fn install_firmware(&mut self, image: &[u8]) -> Result<(), UpdateApplyError> {
        if image.is_empty() {
            return Err(UpdateApplyError::Install("empty firmware image".to_string()));
        }
        let slot = self
            .write_image(image)
            .map_err(|e| UpdateApplyError::Install(format!("{:#}", e)))?;
        log::info!("Firmware ({} bytes) written, active slot is now {}", image.len(), slot);
        Ok(())
    }
}

/// Treats the controller being reachable over TCP as the link being up.
#[derive(Debug)]
pub struct HostLink {
    host: Option<String>,
    port: u16,
    probe_timeout: Duration,
    address: Option<IpAddr>,
}

impl HostLink {
    pub fn for_controller(api_base: &Url, probe_timeout: Duration) -> Self {
        Self {
            host: api_base.host_str().map(str::to_string),
            port: api_base.port_or_known_default().unwrap_or(80),
            probe_timeout,
            address: None,
        }
    }
}

#[async_trait(?Send)]
impl NetworkLink for HostLink {
    async fn begin(&mut self, credentials: &Credentials, hostname: &str) {
        log::info!("SSID: {} (hostname {})", credentials.ssid, hostname);
    }

    async fn status(&mut self) -> LinkStatus {
        let Some(host) = self.host.as_deref() else {
            return LinkStatus::Disconnected;
        };
        match time::timeout(self.probe_timeout, TcpStream::connect((host, self.port))).await {
            Ok(Ok(stream)) => {
                self.address = stream.local_addr().ok().map(|addr| addr.ip());
                LinkStatus::Connected
            }
            _ => {
                self.address = None;
                LinkStatus::Disconnected
            }
        }
    }

    fn local_addr(&self) -> Option<IpAddr> {
        self.address
    }
}
