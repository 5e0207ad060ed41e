//! Persistent delivery channel over websocket.
//!
//! A client first sends `{"type": "init", "client_name": ...}`. That
//! registers it as a persistent subscriber and opens its channel; from then
//! on every event addressed to it arrives as a text frame. `{"type":
//! "exit"}` closes the channel. Every command is answered with a
//! `{code, msg}` frame.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use herald_core::transport::ChannelLease;
use herald_core::{ControlError, ControlResponse};
use tracing::{debug, info, warn};

use crate::routes::{field, parse_body};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new().route("/", get(upgrade)).with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Init { client_name: Option<String> },
    Exit,
}

pub(crate) fn parse_command(text: &str) -> Result<Command, ControlError> {
    let body = parse_body(text)?;
    match field(&body, "type").as_deref() {
        Some("init") => Ok(Command::Init {
            client_name: field(&body, "client_name"),
        }),
        Some("exit") => Ok(Command::Exit),
        _ => Err(ControlError::IllegalCommand),
    }
}

type Sink = SplitSink<WebSocket, Message>;

async fn reply(sink: &mut Sink, response: ControlResponse) -> bool {
    let Ok(text) = serde_json::to_string(&response) else {
        return false;
    };
    sink.send(Message::Text(text.into())).await.is_ok()
}

async fn serve_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let Some((name, mut lease)) = handshake(&mut sink, &mut stream, &state).await else {
        return;
    };

    loop {
        tokio::select! {
            frame = lease.frames.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        warn!("websocket send to {} failed, closing", name);
                        break;
                    }
                }
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_command(text.as_str()) {
                    Ok(Command::Exit) => {
                        reply(&mut sink, ControlResponse::ok()).await;
                        break;
                    }
                    Ok(Command::Init { .. }) => {
                        if !reply(&mut sink, (&ControlError::DuplicateInit).into()).await {
                            break;
                        }
                    }
                    Err(e) => {
                        if !reply(&mut sink, (&e).into()).await {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.control.close_channel(&name, lease.id);
    debug!("websocket session of {} ended", name);
}

/// Waits for a successful `init`. Returns `None` if the client goes away
/// first.
async fn handshake(
    sink: &mut Sink,
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Option<(String, ChannelLease)> {
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        let outcome = match parse_command(text.as_str()) {
            Ok(Command::Init {
                client_name: Some(name),
            }) => state
                .control
                .open_channel(&name)
                .await
                .map(|lease| (name, lease)),
            Ok(Command::Init { client_name: None }) => {
                Err(ControlError::MissingParameter("client_name".to_string()))
            }
            Ok(Command::Exit) => Err(ControlError::NotInitialized),
            Err(e) => Err(e),
        };
        match outcome {
            Ok((name, lease)) => {
                if !reply(sink, ControlResponse::ok()).await {
                    state.control.close_channel(&name, lease.id);
                    return None;
                }
                info!("websocket client {} initialized", name);
                return Some((name, lease));
            }
            Err(e) => {
                if !reply(sink, (&e).into()).await {
                    return None;
                }
            }
        }
    }
    None
}
