//! Inbound command listener.
//!
//! The listener owns no agent state. Each request is forwarded to the runtime over a channel and
//! answered with whatever the runtime's handler replies, once the runtime gets to it in `tick()`.

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::commands::{CommandReply, CommandRequest, InboundCommand};

#[derive(Clone)]
struct ServerState {
    tx: mpsc::Sender<InboundCommand>,
    reply_timeout: Duration,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<InboundCommand>, mpsc::Receiver<InboundCommand>) {
    mpsc::channel(capacity)
}

pub fn router(tx: mpsc::Sender<InboundCommand>, reply_timeout: Duration) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(ServerState { tx, reply_timeout })
}

pub async fn serve(
    listener: TcpListener,
    tx: mpsc::Sender<InboundCommand>,
    reply_timeout: Duration,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server ready");
    }
    axum::serve(listener, router(tx, reply_timeout)).await
}

async fn forward(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    body: String,
) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let command = InboundCommand {
        request: CommandRequest {
            method: method.to_string(),
            path: uri.path().to_string(),
            body,
        },
        reply: reply_tx,
    };

    if state.tx.send(command).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "agent is not accepting commands").into_response();
    }

    match timeout(state.reply_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply.into_response(),
        Ok(Err(_)) => {
            warn!(path = %uri.path(), "Command dropped without a reply");
            (StatusCode::SERVICE_UNAVAILABLE, "agent dropped the command").into_response()
        }
        Err(_) => {
            warn!(path = %uri.path(), "Command not answered in time");
            (StatusCode::GATEWAY_TIMEOUT, "agent did not answer in time").into_response()
        }
    }
}

impl IntoResponse for CommandReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}
