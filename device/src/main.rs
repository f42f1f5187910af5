use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use device_agent::platform::{HostLink, HostPlatform};
use device_agent::storage::SqliteStore;
use device_agent::{server, simulate};
use device_agent::{AgentRuntime, AgentSettings, Board, DeviceConfig, Lifecycle};

const READING_LABEL: &str = "temperature";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Parks the process without touching the network. Unusable config or storage is not retried.
async fn halt() -> Result<()> {
    std::future::pending().await
}

/// A reset ends this process; the supervisor starts the next boot.
fn reset(lifecycle: Lifecycle) {
    if let Lifecycle::Reset(reason) = lifecycle {
        info!(?reason, "Device resetting");
        std::process::exit(0);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let settings = AgentSettings::from_env();
    let config = match DeviceConfig::load(&DeviceConfig::config_file_path()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid device configuration, halting");
            return halt().await;
        }
    };
    info!(device = %config.identity, mode = ?config.power_mode, "Device configuration loaded");

    let store = match SqliteStore::open(&settings.state_db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(
                error = %e,
                path = %settings.state_db_path.display(),
                "Durable state unavailable, halting"
            );
            return halt().await;
        }
    };
    let platform = HostPlatform::new(&settings.host_state_dir, settings.hardware_sleep_budget_secs);
    let link = HostLink::for_controller(&config.api_base, settings.connect_poll_interval);
    let serves_commands = config.power_mode.serves_commands();

    let mut agent = AgentRuntime::new(config, settings.clone(), Board { platform, link, store });
    agent.set_reading_validator(READING_LABEL, |celsius| (-40.0..=85.0).contains(&celsius));

    if serves_commands {
        let listener = TcpListener::bind(&settings.command_listen_addr)
            .await
            .with_context(|| format!("binding {}", settings.command_listen_addr))?;
        let (tx, rx) = server::channel(16);
        tokio::spawn(server::serve(listener, tx, settings.command_reply_timeout));
        agent.attach_inbound(rx);
    }

    reset(agent.boot().await);

    loop {
        let reading = simulate::temperature();
        if let Err(e) = agent.report_value(READING_LABEL, reading).await {
            warn!(error = %e, "Reading not delivered");
        }
        reset(agent.tick().await);
    }
}
