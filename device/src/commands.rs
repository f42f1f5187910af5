use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::platform::RestartKind;
use crate::types::LatestValues;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl CommandReply {
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.into(),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/html",
            body: body.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: format!("no handler for {path}"),
        }
    }
}

/// What a handler may see and do. Handlers never reach the runtime directly.
pub struct CommandContext<'a> {
    config: &'a DeviceConfig,
    latest: &'a LatestValues,
    restart: Option<RestartKind>,
}

impl<'a> CommandContext<'a> {
    pub fn new(config: &'a DeviceConfig, latest: &'a LatestValues) -> Self {
        Self {
            config,
            latest,
            restart: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        self.config
    }

    pub fn latest_values(&self) -> &LatestValues {
        self.latest
    }

    /// Restart once the reply has been handed back.
    pub fn request_restart(&mut self, kind: RestartKind) {
        self.restart = Some(kind);
    }

    pub fn restart_requested(&self) -> Option<RestartKind> {
        self.restart
    }
}

pub type CommandHandler = Box<dyn FnMut(&mut CommandContext<'_>, &CommandRequest) -> CommandReply>;

/// A request forwarded by the listener, with the channel its reply goes back on.
#[derive(Debug)]
pub struct InboundCommand {
    pub request: CommandRequest,
    pub reply: oneshot::Sender<CommandReply>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Path-keyed handler table.
pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// `/values`, `/reboot` and `/reset`.
    pub fn with_builtin_routes() -> Self {
        let mut router = Self::new();
        router.register("/values", |ctx, _| {
            CommandReply::json(ctx.latest_values().to_json())
        });
        router.register("/reboot", |ctx, _| {
            info!("Rebooting ...");
            ctx.request_restart(RestartKind::Reboot);
            CommandReply::html("Rebooting, please wait ...")
        });
        router.register("/reset", |ctx, _| {
            info!("Resetting ...");
            ctx.request_restart(RestartKind::Reset);
            CommandReply::json("{}")
        });
        router
    }

    /// Registers `handler` for `path`, replacing any previous handler.
    pub fn register<F>(&mut self, path: &str, handler: F)
    where
        F: FnMut(&mut CommandContext<'_>, &CommandRequest) -> CommandReply + 'static,
    {
        self.handlers.insert(normalize(path), Box::new(handler));
    }

    pub fn dispatch(&mut self, ctx: &mut CommandContext<'_>, request: &CommandRequest) -> CommandReply {
        let path = normalize(&request.path);
        match self.handlers.get_mut(&path) {
            Some(handler) => {
                debug!(method = %request.method, path = %path, "Dispatching command");
                handler(ctx, request)
            }
            None => CommandReply::not_found(&path),
        }
    }
}
