mod support;

use std::time::Duration;
use tokio::sync::oneshot;

use device_agent::commands::{CommandReply, CommandRequest, InboundCommand};
use device_agent::config::PowerMode;
use device_agent::error::{ConfigError, TransmitError};
use device_agent::platform::{ResetCause, RestartKind};
use device_agent::server;
use device_agent::simulate::{SimulatedLink, SimulatedPlatform};
use device_agent::state::{PersistedState, UpdateFlag};
use device_agent::storage::MemoryStore;
use device_agent::{AgentRuntime, Board, Lifecycle, ResetReason};
use support::{config_json, test_settings, ControllerBehavior, FakeController, FirmwareBehavior};

type SimRuntime = AgentRuntime<SimulatedPlatform, SimulatedLink, MemoryStore>;

fn board(link: SimulatedLink) -> Board<SimulatedPlatform, SimulatedLink, MemoryStore> {
    Board {
        platform: SimulatedPlatform::new(4200),
        link,
        store: MemoryStore::new(),
    }
}

fn runtime(raw: &str, board: Board<SimulatedPlatform, SimulatedLink, MemoryStore>) -> SimRuntime {
    AgentRuntime::from_raw(raw, test_settings(), board).unwrap()
}

fn command(path: &str) -> (InboundCommand, oneshot::Receiver<CommandReply>) {
    let (reply, rx) = oneshot::channel();
    let command = InboundCommand {
        request: CommandRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            body: String::new(),
        },
        reply,
    };
    (command, rx)
}

#[tokio::test]
async fn bad_config_contacts_nobody() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 0, 60, 4).replace("apiUrl", "api_url");

    let result = AgentRuntime::from_raw(&raw, test_settings(), board(SimulatedLink::online()));
    assert!(matches!(result, Err(ConfigError::MissingField("apiUrl"))));
    assert!(controller.calls().is_empty());
}

#[tokio::test]
async fn newer_firmware_is_applied_on_the_next_boot() {
    support::init_tracing();
    let controller = FakeController::start(ControllerBehavior {
        advertised_version: Some(5),
        ..ControllerBehavior::default()
    })
    .await;
    let raw = config_json(&controller.api_url(), 0, 60, 4);

    let mut first = runtime(&raw, board(SimulatedLink::connecting_after(1)));
    assert_eq!(
        first.boot().await,
        Lifecycle::Reset(ResetReason::UpdateScheduled { version: 5 })
    );
    assert_eq!(first.platform().restarts(), &[RestartKind::Reboot]);
    assert_eq!(first.state().update_flag(), UpdateFlag::UpdateRequested);

    let mut board = first.into_board();
    board.platform.reboot(ResetCause::SoftwareRestart);
    controller.update(|b| {
        b.advertised_version = None;
        b.firmware = FirmwareBehavior::Status(500);
    });

    let mut second = runtime(&raw, board);
    assert!(matches!(
        second.report_value("temperature", 20.0).await,
        Err(TransmitError::UpdatePending)
    ));
    assert_eq!(second.boot().await, Lifecycle::Running);

    // A failed fetch still clears the flag, so the device is not stuck retrying.
    assert_eq!(second.state().update_flag(), UpdateFlag::Normal);
    assert_eq!(controller.calls_to("/esp/firmware/upgrade/").len(), 1);
    assert_eq!(second.platform().restarts().len(), 1);
    assert!(controller.calls_to("/esp/sensor/set/").is_empty());
}

#[tokio::test]
async fn installed_firmware_restarts_the_device() {
    let controller = FakeController::start(ControllerBehavior {
        firmware: FirmwareBehavior::Image(vec![0xE9; 512]),
        ..ControllerBehavior::default()
    })
    .await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut state = PersistedState::new(MemoryStore::new());
    state.set_update_flag(UpdateFlag::UpdateRequested).unwrap();
    let mut agent = runtime(
        &raw,
        Board {
            platform: SimulatedPlatform::new(4200).with_reset_cause(ResetCause::SoftwareRestart),
            link: SimulatedLink::connecting_after(2),
            store: state.into_inner(),
        },
    );

    assert_eq!(
        agent.boot().await,
        Lifecycle::Reset(ResetReason::FirmwareInstalled)
    );
    assert_eq!(agent.platform().installed(), &[512]);
    assert_eq!(agent.platform().restarts(), &[RestartKind::Reboot]);
    assert_eq!(agent.state().update_flag(), UpdateFlag::Normal);
    assert!(controller.calls_to("/esp/ping/").is_empty());
}

#[tokio::test]
async fn deep_sleep_rest_spans_boots() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 0, 7200, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::connecting_after(1)));
    assert_eq!(agent.boot().await, Lifecycle::Running);
    agent.report_value("temperature", 19.25).await.unwrap();
    assert_eq!(agent.tick().await, Lifecycle::Reset(ResetReason::DeepSleep));
    assert_eq!(agent.state().rest_tick(), Some(1));
    assert_eq!(controller.calls_to("/esp/ping/").len(), 1);

    // Intermediate wake: straight back to sleep, no network.
    let mut board = agent.into_board();
    board.platform.reboot(ResetCause::DeepSleepAwake);
    let mut agent = runtime(&raw, board);
    assert_eq!(agent.boot().await, Lifecycle::Reset(ResetReason::DeepSleep));
    assert_eq!(agent.state().rest_tick(), Some(2));
    assert_eq!(controller.calls_to("/esp/ping/").len(), 1);

    // Final wake: the rest is over and the device checks in again.
    let mut board = agent.into_board();
    board.platform.reboot(ResetCause::DeepSleepAwake);
    let mut agent = runtime(&raw, board);
    assert_eq!(agent.boot().await, Lifecycle::Running);
    assert_eq!(agent.state().rest_tick(), Some(1));
    assert_eq!(controller.calls_to("/esp/ping/").len(), 2);

    assert_eq!(
        agent.platform().sleeps(),
        &[(PowerMode::DeepSleep, 4200), (PowerMode::DeepSleep, 3000)]
    );
    assert_eq!(agent.platform().total_slept(), 7200);
}

#[tokio::test]
async fn offline_boot_waits_and_refuses_readings() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::unreachable()));
    assert_eq!(agent.boot().await, Lifecycle::Running);
    assert_eq!(agent.connection(), None);
    assert_eq!(agent.platform().sleeps(), &[(PowerMode::SleepDelay, 30)]);
    assert_eq!(agent.link().polls(), 3);

    assert!(matches!(
        agent.report_value("temperature", 20.0).await,
        Err(TransmitError::NotConnected)
    ));
    assert!(agent.latest_values().is_empty());
    assert!(controller.calls().is_empty());
}

#[tokio::test]
async fn tick_rejoins_a_dropped_network() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::connecting_after(1)));
    assert_eq!(agent.boot().await, Lifecycle::Running);
    assert_eq!(agent.link().begin_calls(), 1);

    let mut board = agent.into_board();
    board.link.drop_connection();
    let mut agent = runtime(&raw, board);

    assert_eq!(agent.tick().await, Lifecycle::Running);
    assert_eq!(agent.link().begin_calls(), 2);
    let connection = agent.connection().unwrap();
    assert_eq!(connection.attempts, 1);
    assert!(connection.address.is_some());
    assert_eq!(controller.calls_to("/esp/ping/").len(), 2);
    assert_eq!(agent.platform().sleeps(), &[(PowerMode::SleepDelay, 60)]);
}

#[tokio::test]
async fn tick_waits_out_a_lost_network() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::connecting_after(1)));
    assert_eq!(agent.boot().await, Lifecycle::Running);

    let mut board = agent.into_board();
    board.link.out_of_range();
    let mut agent = runtime(&raw, board);

    assert_eq!(agent.tick().await, Lifecycle::Running);
    assert_eq!(agent.connection(), None);
    assert_eq!(agent.link().begin_calls(), 2);
    assert_eq!(agent.link().polls(), 3);
    assert_eq!(
        agent.platform().sleeps(),
        &[(PowerMode::SleepDelay, 30), (PowerMode::SleepDelay, 60)]
    );
    assert_eq!(controller.calls_to("/esp/ping/").len(), 1);
}

#[tokio::test]
async fn light_sleep_heartbeats_every_tick() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 3, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::online()));
    assert_eq!(agent.boot().await, Lifecycle::Running);
    assert_eq!(agent.tick().await, Lifecycle::Running);
    assert_eq!(agent.tick().await, Lifecycle::Running);

    assert_eq!(controller.calls_to("/esp/ping/").len(), 3);
    assert_eq!(
        agent.platform().sleeps(),
        &[(PowerMode::LightSleep, 60), (PowerMode::LightSleep, 60)]
    );
}

#[tokio::test]
async fn heartbeat_on_tick_can_schedule_an_update() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::online()));
    assert_eq!(agent.boot().await, Lifecycle::Running);
    controller.update(|b| b.advertised_version = Some(6));

    assert_eq!(
        agent.tick().await,
        Lifecycle::Reset(ResetReason::UpdateScheduled { version: 6 })
    );
    assert!(agent.platform().sleeps().is_empty());
}

#[tokio::test]
async fn always_on_serves_registered_and_builtin_commands() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 2, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::online()));
    let (tx, rx) = server::channel(8);
    agent.attach_inbound(rx);
    agent.register_command_handler("/relay/on", |ctx, request| {
        CommandReply::json(format!(
            r#"{{"device": "{}", "method": "{}"}}"#,
            ctx.config().identity,
            request.method
        ))
    });

    assert_eq!(agent.boot().await, Lifecycle::Running);
    agent.report_value("temperature", 21.5).await.unwrap();

    let (relay, relay_reply) = command("/relay/on");
    let (values, values_reply) = command("/values/");
    tx.send(relay).await.unwrap();
    tx.send(values).await.unwrap();
    assert_eq!(agent.tick().await, Lifecycle::Running);

    assert_eq!(
        relay_reply.await.unwrap().body,
        r#"{"device": "node-7", "method": "GET"}"#
    );
    let values: serde_json::Value = serde_json::from_str(&values_reply.await.unwrap().body).unwrap();
    assert_eq!(values["temperature"]["value"], 21.5);
    assert!(agent.platform().sleeps().is_empty());

    let (reboot, reboot_reply) = command("/reboot");
    tx.send(reboot).await.unwrap();
    assert_eq!(
        agent.tick().await,
        Lifecycle::Reset(ResetReason::Requested(RestartKind::Reboot))
    );
    assert_eq!(reboot_reply.await.unwrap().body, "Rebooting, please wait ...");
    assert_eq!(agent.platform().restarts(), &[RestartKind::Reboot]);
}

#[tokio::test]
async fn commands_are_not_served_while_an_update_is_pending() {
    let controller = FakeController::start(ControllerBehavior {
        advertised_version: Some(9),
        ..ControllerBehavior::default()
    })
    .await;
    let raw = config_json(&controller.api_url(), 1, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::online()));
    let (tx, rx) = server::channel(8);
    agent.attach_inbound(rx);
    assert_eq!(
        agent.boot().await,
        Lifecycle::Reset(ResetReason::UpdateScheduled { version: 9 })
    );

    let (values, mut values_reply) = command("/values");
    tx.send(values).await.unwrap();
    agent.tick().await;
    assert!(values_reply.try_recv().is_err());
}

#[tokio::test]
async fn http_listener_reaches_the_runtime() {
    let controller = FakeController::start(ControllerBehavior::default()).await;
    let raw = config_json(&controller.api_url(), 2, 60, 4);

    let mut agent = runtime(&raw, board(SimulatedLink::online()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = server::channel(8);
    tokio::spawn(server::serve(listener, tx, Duration::from_secs(5)));
    agent.attach_inbound(rx);

    assert_eq!(agent.boot().await, Lifecycle::Running);
    agent.report_value("humidity", 48.0).await.unwrap();

    let request = tokio::spawn(async move {
        let response = reqwest::get(format!("http://{addr}/values")).await.unwrap();
        assert_eq!(response.status(), 200);
        response.json::<serde_json::Value>().await.unwrap()
    });
    for _ in 0..25 {
        if request.is_finished() {
            break;
        }
        assert_eq!(agent.tick().await, Lifecycle::Running);
    }

    let values = request.await.unwrap();
    assert_eq!(values["humidity"]["value"], 48.0);
}
