use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

use crate::config::{Credentials, PowerMode};
use crate::error::UpdateApplyError;
use crate::platform::{LinkStatus, NetworkLink, Platform, ResetCause, RestartKind, SleepResult};

/// A battery slowly sagging below 3.3 V.
pub fn supply_voltage() -> f32 {
    3.3 - rand::random::<f32>() * 0.2
}

/// Room temperature with a little noise, 17.5 to 22.5.
pub fn temperature() -> f64 {
    20.0 + (rand::random::<f64>() * 5.0) - 2.5
}

/// In-process board: sleeps are recorded instead of waited, resets are reported.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    sleep_budget_secs: u64,
    reset_cause: ResetCause,
    sleeps: Vec<(PowerMode, u64)>,
    restarts: Vec<RestartKind>,
    installed: Vec<usize>,
    fail_installs: bool,
    voltage: f32,
}

impl SimulatedPlatform {
    pub fn new(sleep_budget_secs: u64) -> Self {
        Self {
            sleep_budget_secs,
            reset_cause: ResetCause::PowerOn,
            sleeps: Vec::new(),
            restarts: Vec::new(),
            installed: Vec::new(),
            fail_installs: false,
            voltage: 3.3,
        }
    }

    pub fn with_reset_cause(mut self, cause: ResetCause) -> Self {
        self.reset_cause = cause;
        self
    }

    pub fn failing_installs(mut self) -> Self {
        self.fail_installs = true;
        self
    }

    /// Starts the next boot with the given cause; history is kept.
    pub fn reboot(&mut self, cause: ResetCause) {
        self.reset_cause = cause;
    }

    pub fn sleeps(&self) -> &[(PowerMode, u64)] {
        &self.sleeps
    }

    pub fn total_slept(&self) -> u64 {
        self.sleeps.iter().map(|(_, secs)| secs).sum()
    }

    pub fn restarts(&self) -> &[RestartKind] {
        &self.restarts
    }

    pub fn installed(&self) -> &[usize] {
        &self.installed
    }
}

#[async_trait(?Send)]
impl Platform for SimulatedPlatform {
    fn reset_cause(&self) -> ResetCause {
        self.reset_cause
    }

    fn hardware_sleep_budget(&self) -> u64 {
        self.sleep_budget_secs
    }

    async fn sleep(&mut self, mode: PowerMode, seconds: u64) -> SleepResult {
        if mode == PowerMode::AlwaysOn {
            return SleepResult::Resumed;
        }
        self.sleeps.push((mode, seconds));
        if mode == PowerMode::DeepSleep {
            SleepResult::Reset
        } else {
            SleepResult::Resumed
        }
    }

    fn restart(&mut self, kind: RestartKind) {
        self.restarts.push(kind);
    }

    fn free_memory(&self) -> u64 {
        40_960
    }

    fn supply_voltage(&self) -> f32 {
        self.voltage
    }

    fn install_firmware(&mut self, image: &[u8]) -> Result<(), UpdateApplyError> {
        if self.fail_installs {
            return Err(UpdateApplyError::Install("simulated flash failure".to_string()));
        }
        self.installed.push(image.len());
        Ok(())
    }
}

/// A radio that associates after a fixed number of status polls, or never.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    connect_after: Option<u32>,
    connected: bool,
    associating: bool,
    polls: u32,
    begin_calls: u32,
    address: IpAddr,
}

impl SimulatedLink {
    pub fn connecting_after(polls: u32) -> Self {
        Self {
            connect_after: Some(polls),
            connected: false,
            associating: false,
            polls: 0,
            begin_calls: 0,
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            connect_after: None,
            ..Self::connecting_after(0)
        }
    }

    pub fn online() -> Self {
        Self {
            connected: true,
            ..Self::connecting_after(0)
        }
    }

    /// Drops the association, as after an access point restart. The link stays down until the
    /// next `begin`.
    pub fn drop_connection(&mut self) {
        self.connected = false;
        self.associating = false;
        self.polls = 0;
    }

    /// Drops the association and never associates again.
    pub fn out_of_range(&mut self) {
        self.drop_connection();
        self.connect_after = None;
    }

    pub fn begin_calls(&self) -> u32 {
        self.begin_calls
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

#[async_trait(?Send)]
impl NetworkLink for SimulatedLink {
    async fn begin(&mut self, _credentials: &Credentials, _hostname: &str) {
        self.begin_calls += 1;
        self.associating = true;
        self.polls = 0;
    }

    async fn status(&mut self) -> LinkStatus {
        if !self.connected && self.associating {
            self.polls += 1;
            if self.connect_after.is_some_and(|n| self.polls >= n) {
                self.connected = true;
            }
        }
        if self.connected {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn local_addr(&self) -> Option<IpAddr> {
        self.connected.then_some(self.address)
    }
}
