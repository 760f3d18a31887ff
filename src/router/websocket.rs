//! WebSocket push channel (spec §4.6, §6). After upgrade, the server
//! pushes `Event` envelopes and accepts a handful of control messages.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::{BusMessage, GapTrackingReceiver};

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientControl {
    Subscribe { from_sequence: Option<u64> },
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Default: start live with no replay until the client asks for one.
    let (mut replay, broadcast_rx) = state.events.subscribe(None);
    let mut last_delivered = replay.last().map(|e| e.sequence).unwrap_or(0);
    let mut tracked = GapTrackingReceiver::new(broadcast_rx, last_delivered);

    for event in replay.drain(..) {
        if sender.send(Message::Text(serde_json::to_string(&event).unwrap_or_default())).await.is_err() {
            return;
        }
    }

    info!("websocket client connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientControl>(&text) {
                            Ok(ClientControl::Subscribe { from_sequence }) => {
                                let (mut backlog, broadcast_rx) = state.events.subscribe(from_sequence);
                                last_delivered = backlog.last().map(|e| e.sequence).unwrap_or(last_delivered);
                                tracked = GapTrackingReceiver::new(broadcast_rx, last_delivered);
                                for event in backlog.drain(..) {
                                    if sender.send(Message::Text(serde_json::to_string(&event).unwrap_or_default())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(ClientControl::Ping) => {
                                if sender.send(Message::Text(json!({"type": "pong"}).to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring malformed websocket control message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("websocket client disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return;
                    }
                    _ => {}
                }
            }
            message = tracked.recv() => {
                match message {
                    Some(BusMessage::Event(event)) => {
                        last_delivered = event.sequence;
                        if sender.send(Message::Text(serde_json::to_string(&event).unwrap_or_default())).await.is_err() {
                            return;
                        }
                    }
                    Some(BusMessage::Gap(gap)) => {
                        let payload = json!({ "type": "gap", "from": gap.from });
                        if sender.send(Message::Text(payload.to_string())).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        debug!("event bus closed, ending websocket session");
                        return;
                    }
                }
            }
        }
    }
}
