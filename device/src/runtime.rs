use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::commands::{
    CommandContext, CommandReply, CommandRequest, CommandRouter, InboundCommand,
};
use crate::config::{AgentSettings, DeviceConfig, PowerMode};
use crate::connectivity::{AttemptBudget, Connected, ConnectivityManager};
use crate::error::{ConfigError, ConnectionFailed, TransmitError, UpdateApplyError};
use crate::net::ControllerClient;
use crate::ota::{ApplyOutcome, HeartbeatProbe, UpdateCoordinator};
use crate::platform::{LinkStatus, NetworkLink, Platform, RestartKind};
use crate::scheduler::{RestOutcome, SleepScheduler};
use crate::state::PersistedState;
use crate::storage::DurableStore;
use crate::telemetry::TelemetryReporter;
use crate::types::{Ack, LatestValues};

/// The hardware the runtime drives.
pub struct Board<P, L, S> {
    pub platform: P,
    pub link: L,
    pub store: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    DeepSleep,
    UpdateScheduled { version: u32 },
    FirmwareInstalled,
    Requested(RestartKind),
}

/// Whether control stays in this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// The device is resetting; the caller must stop and let the next boot take over.
    Reset(ResetReason),
}

/// One boot of the agent. Owns every component; nothing is shared globally.
pub struct AgentRuntime<P, L, S> {
    config: DeviceConfig,
    settings: AgentSettings,
    platform: P,
    link: L,
    state: PersistedState<S>,
    connectivity: ConnectivityManager,
    updates: UpdateCoordinator,
    reporter: TelemetryReporter,
    commands: CommandRouter,
    inbound: Option<mpsc::Receiver<InboundCommand>>,
    connection: Option<Connected>,
    boot_id: Uuid,
}

impl<P, L, S> AgentRuntime<P, L, S>
where
    P: Platform,
    L: NetworkLink,
    S: DurableStore,
{
    pub fn new(config: DeviceConfig, settings: AgentSettings, board: Board<P, L, S>) -> Self {
        let client = ControllerClient::new(config.api_base.clone());
        let reporter = TelemetryReporter::new(
            client,
            config.identity.clone(),
            settings.sensor_timeout,
            settings.ping_timeout,
        );
        let connectivity = ConnectivityManager::new(AttemptBudget::from_duration(
            settings.connect_budget,
            settings.connect_poll_interval,
        ));

        Self {
            updates: UpdateCoordinator::new(settings.firmware_timeout),
            config,
            settings,
            platform: board.platform,
            link: board.link,
            state: PersistedState::new(board.store),
            connectivity,
            reporter,
            commands: CommandRouter::with_builtin_routes(),
            inbound: None,
            connection: None,
            boot_id: Uuid::new_v4(),
        }
    }

    /// Parses `raw_config` first; on error nothing is constructed and nothing is contacted.
    pub fn from_raw(
        raw_config: &str,
        settings: AgentSettings,
        board: Board<P, L, S>,
    ) -> Result<Self, ConfigError> {
        let config = DeviceConfig::parse(raw_config)?;
        Ok(Self::new(config, settings, board))
    }

    /// Hands the runtime the receiving end of the command listener.
    pub fn attach_inbound(&mut self, rx: mpsc::Receiver<InboundCommand>) {
        self.inbound = Some(rx);
    }

    pub fn register_command_handler<F>(&mut self, path: &str, handler: F)
    where
        F: FnMut(&mut CommandContext<'_>, &CommandRequest) -> CommandReply + 'static,
    {
        self.commands.register(path, handler);
    }

    pub fn set_reading_validator<F>(&mut self, label: &str, accept: F)
    where
        F: Fn(f64) -> bool + 'static,
    {
        self.reporter.set_validator(label, accept);
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn state(&self) -> &PersistedState<S> {
        &self.state
    }

    pub fn latest_values(&self) -> &LatestValues {
        self.reporter.latest_values()
    }

    pub fn connection(&self) -> Option<Connected> {
        self.connection
    }

    /// Gives the hardware back, e.g. to simulate the next boot.
    pub fn into_board(self) -> Board<P, L, S> {
        Board {
            platform: self.platform,
            link: self.link,
            store: self.state.into_inner(),
        }
    }

    /// Boot sequence: pending update, reset cause, rest resumption, connect, heartbeat.
    pub async fn boot(&mut self) -> Lifecycle {
        let span = info_span!(
            "boot",
            boot_id = %self.boot_id,
            device = %self.config.identity
        );
        self.boot_sequence().instrument(span).await
    }

    async fn boot_sequence(&mut self) -> Lifecycle {
        info!(
            version = self.config.firmware_version,
            mode = ?self.config.power_mode,
            interval = self.config.rest_interval_secs,
            "Agent booting"
        );

        if self.updates.is_update_pending(&self.state) {
            info!("Entering firmware update mode");
            match self.apply_pending_update().await {
                Ok(ApplyOutcome::Installed { .. }) => {
                    info!("Firmware updated! Rebooting ...");
                    return self.restart(RestartKind::Reboot, ResetReason::FirmwareInstalled);
                }
                Ok(ApplyOutcome::NoUpdate) => info!("Firmware no update"),
                Err(e) => error!(error = %e, "Firmware update failed, continuing"),
            }
        }

        let cause = self.platform.reset_cause();
        info!(?cause, "Reset reason");
        let (interval, mode) = (self.config.rest_interval_secs, self.config.power_mode);
        let mut scheduler = SleepScheduler::new(&mut self.platform, &mut self.state);
        scheduler.apply_reset_cause(cause);
        if scheduler.resume(interval, mode).await == RestOutcome::Reset {
            return Lifecycle::Reset(ResetReason::DeepSleep);
        }

        if let Err(e) = self.connect().await {
            self.wait_for_retry(&e).await;
            return Lifecycle::Running;
        }

        self.heartbeat().await.unwrap_or(Lifecycle::Running)
    }

    /// Sends one reading. Never retried; a failure leaves the latest-values cache untouched.
    pub async fn report_value(&mut self, label: &str, value: f64) -> Result<Ack, TransmitError> {
        if self.state.update_pending() {
            return Err(TransmitError::UpdatePending);
        }
        if self.link.status().await != LinkStatus::Connected {
            warn!(label, "Could not transmit data. Not connected to network.");
            return Err(TransmitError::NotConnected);
        }
        let vcc = self.platform.supply_voltage();
        self.reporter.post(label, value, vcc).await
    }

    /// One pass of the main loop: reconnect, heartbeat, serve commands, rest.
    pub async fn tick(&mut self) -> Lifecycle {
        let mode = self.config.power_mode;

        let online = match self.connect().await {
            Ok(_) => true,
            Err(e) => {
                self.wait_for_retry(&e).await;
                false
            }
        };

        if online && mode.heartbeats_on_tick() {
            if let Some(lifecycle) = self.heartbeat().await {
                return lifecycle;
            }
        }

        if self.can_serve_commands() {
            let wait = if mode == PowerMode::AlwaysOn {
                self.settings.idle_poll_interval
            } else {
                Duration::ZERO
            };
            if let Some(lifecycle) = self.service_commands(wait).await {
                return lifecycle;
            }
        } else if mode == PowerMode::AlwaysOn {
            time::sleep(self.settings.idle_poll_interval).await;
        }

        let interval = self.config.rest_interval_secs;
        match SleepScheduler::new(&mut self.platform, &mut self.state)
            .request_rest(interval, mode)
            .await
        {
            RestOutcome::Reset => Lifecycle::Reset(ResetReason::DeepSleep),
            RestOutcome::Completed | RestOutcome::Skipped => Lifecycle::Running,
        }
    }

    fn can_serve_commands(&self) -> bool {
        self.config.power_mode.serves_commands() && !self.state.update_pending()
    }

    async fn connect(&mut self) -> Result<Connected, ConnectionFailed> {
        let hostname = self.config.hostname();
        let result = self
            .connectivity
            .ensure_connected(&mut self.link, &self.config.credentials, &hostname)
            .await;
        self.connection = result.as_ref().ok().copied();
        result
    }

    async fn wait_for_retry(&mut self, failure: &ConnectionFailed) {
        let retry = self.settings.connect_retry_secs;
        warn!(error = %failure, retry_secs = retry, "Connection failed, trying again later");
        self.platform.sleep(PowerMode::SleepDelay, retry).await;
    }

    async fn heartbeat(&mut self) -> Option<Lifecycle> {
        let probe = HeartbeatProbe {
            free_memory: self.platform.free_memory(),
            vcc: self.platform.supply_voltage(),
            address: self.connection.and_then(|c| c.address),
        };
        let version = self
            .updates
            .check_for_update(
                &self.reporter,
                &mut self.state,
                probe,
                self.config.firmware_version,
            )
            .await?;
        Some(self.restart(RestartKind::Reboot, ResetReason::UpdateScheduled { version }))
    }

    async fn apply_pending_update(&mut self) -> Result<ApplyOutcome, UpdateApplyError> {
        self.updates.take_pending(&mut self.state);
        self.connect().await?;
        self.updates
            .fetch_and_install(
                self.reporter.client(),
                &self.config.identity,
                self.config.firmware_version,
                &mut self.platform,
            )
            .await
    }

    /// Waits up to `wait` for the first command, then drains whatever else is queued.
    async fn service_commands(&mut self, wait: Duration) -> Option<Lifecycle> {
        let rx = match self.inbound.as_mut() {
            Some(rx) => rx,
            None => {
                if !wait.is_zero() {
                    time::sleep(wait).await;
                }
                return None;
            }
        };

        let mut next = if wait.is_zero() {
            rx.try_recv().ok()
        } else {
            time::timeout(wait, rx.recv()).await.ok().flatten()
        };

        let mut restart = None;
        while let Some(command) = next {
            let mut ctx = CommandContext::new(&self.config, self.reporter.latest_values());
            let reply = self.commands.dispatch(&mut ctx, &command.request);
            if command.reply.send(reply).is_err() {
                warn!(path = %command.request.path, "Command caller went away");
            }
            if let Some(kind) = ctx.restart_requested() {
                restart = Some(kind);
                break;
            }
            next = rx.try_recv().ok();
        }

        restart.map(|kind| self.restart(kind, ResetReason::Requested(kind)))
    }

    fn restart(&mut self, kind: RestartKind, reason: ResetReason) -> Lifecycle {
        info!(?kind, ?reason, "Restarting");
        self.platform.restart(kind);
        Lifecycle::Reset(reason)
    }
}
