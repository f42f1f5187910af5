//! Runtime agent for battery- or mains-powered sensor/actuator nodes.
//!
//! The agent reports telemetry to a controller over HTTP, heartbeats with its firmware version,
//! applies controller-provided firmware on the following boot, and rests between cycles in the
//! configured power mode. Rests longer than one hardware sleep are carried across resets through
//! a small durable store.
//!
//! Plugin code talks to [`runtime::AgentRuntime`] only: `boot`, `report_value`, `tick` and
//! `register_command_handler`.

pub mod commands;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod net;
pub mod ota;
pub mod platform;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod simulate;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use config::{AgentSettings, DeviceConfig, PowerMode};
pub use runtime::{AgentRuntime, Board, Lifecycle, ResetReason};
