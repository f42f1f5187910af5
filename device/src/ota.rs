use std::net::IpAddr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::UpdateApplyError;
use crate::net::ControllerClient;
use crate::platform::Platform;
use crate::state::{PersistedState, UpdateFlag};
use crate::storage::DurableStore;
use crate::telemetry::TelemetryReporter;
use crate::types::FirmwareRequest;

/// What the heartbeat reports about the device.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatProbe {
    pub free_memory: u64,
    pub vcc: f32,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Installed { bytes: usize },
    NoUpdate,
}

/// Version-gated firmware updates.
///
/// Detection only records intent and asks for a restart; the flash happens on the next boot,
/// before anything else touches the network.
#[derive(Debug, Clone)]
pub struct UpdateCoordinator {
    firmware_timeout: Duration,
}

impl UpdateCoordinator {
    pub fn new(firmware_timeout: Duration) -> Self {
        Self { firmware_timeout }
    }

    pub fn is_update_pending<S: DurableStore>(&self, state: &PersistedState<S>) -> bool {
        state.update_pending()
    }

    /// Heartbeat. Returns the newer version when one was found and recorded; the caller must
    /// restart the device.
    pub async fn check_for_update<S: DurableStore>(
        &self,
        reporter: &TelemetryReporter,
        state: &mut PersistedState<S>,
        probe: HeartbeatProbe,
        current_version: u32,
    ) -> Option<u32> {
        if state.update_pending() {
            info!("Update pending, skipping heartbeat");
            return None;
        }

        let reply = reporter
            .ping(probe.free_memory, probe.vcc, current_version, probe.address)
            .await?;
        let advertised = reply.advertised_version()?;
        if advertised <= current_version {
            info!(current_version, advertised, "Device is up to date.");
            return None;
        }

        info!(current_version, advertised, "New firmware version available");
        match state.set_update_flag(UpdateFlag::UpdateRequested) {
            Ok(()) => Some(advertised),
            Err(e) => {
                // Restarting without the flag would just lose the update.
                error!(error = %e, "Could not record pending update");
                None
            }
        }
    }

    /// Clears the pending flag ahead of the attempt, whatever its outcome will be.
    pub fn take_pending<S: DurableStore>(&self, state: &mut PersistedState<S>) -> bool {
        if !state.update_pending() {
            return false;
        }
        info!("Resetting firmware indicator");
        if let Err(e) = state.set_update_flag(UpdateFlag::Normal) {
            error!(error = %e, "Could not clear pending update flag");
        }
        true
    }

    pub async fn fetch_and_install<P: Platform>(
        &self,
        client: &ControllerClient,
        identity: &str,
        current_version: u32,
        platform: &mut P,
    ) -> Result<ApplyOutcome, UpdateApplyError> {
        let url = client.endpoint(&["esp", "firmware", "upgrade", identity]);
        let request = FirmwareRequest {
            id: identity,
            version: current_version,
        };

        let Some(image) = client
            .fetch_image(url, &request, self.firmware_timeout)
            .await?
        else {
            warn!("Controller had no firmware for this device");
            return Ok(ApplyOutcome::NoUpdate);
        };

        platform.install_firmware(&image)?;
        info!(bytes = image.len(), "Firmware updated");
        Ok(ApplyOutcome::Installed { bytes: image.len() })
    }
}
