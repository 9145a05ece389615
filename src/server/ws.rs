use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::SharedState;
use crate::model::JobId;
use crate::progress::{ProgressHub, Topic};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound buffer per connection.
const OUTBOUND_CAPACITY: usize = 256;

// ── Client messages ──────────────────────────────────────────────────

/// `{"type": "subscribe:job", "id": "<uuid>"}` and friends.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

fn parse_command(text: &str) -> Result<Command, String> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| format!("malformed message: {e}"))?;
    let (action, kind) = msg
        .kind
        .split_once(':')
        .ok_or_else(|| format!("unknown message type: {}", msg.kind))?;
    let topic = match kind {
        "job" => Topic::Job(
            msg.id
                .parse::<JobId>()
                .map_err(|_| format!("invalid job id: {}", msg.id))?,
        ),
        "project" if !msg.id.is_empty() => Topic::Project(msg.id),
        "project" => return Err("project id must not be empty".to_string()),
        other => return Err(format!("unknown topic kind: {other}")),
    };
    match action {
        "subscribe" => Ok(Command::Subscribe(topic)),
        "unsubscribe" => Ok(Command::Unsubscribe(topic)),
        other => Err(format!("unknown action: {other}")),
    }
}

fn control_message(event: &str, topic: Option<&Topic>, message: Option<&str>) -> String {
    let mut body = serde_json::json!({"event": event});
    if let Some(topic) = topic {
        body["topic"] = serde_json::json!(topic.to_string());
    }
    if let Some(message) = message {
        body["data"] = serde_json::json!({"message": message});
    }
    body.to_string()
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Forward one topic's events into the connection's outbound channel.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<crate::progress::TopicEvent>,
    out: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if out.send(event.to_json().to_string()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, hub: std::sync::Arc<ProgressHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let mut subscriptions: HashMap<Topic, JoinHandle<()>> = HashMap::new();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Subscribed events ───────────────────────────────────
            Some(text) = out_rx.recv() => {
                if send_text(&mut sender, text).await.is_err() {
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match parse_command(text.as_str()) {
                            Ok(Command::Subscribe(topic)) => {
                                let forwarder = spawn_forwarder(hub.subscribe(topic.clone()), out_tx.clone());
                                if let Some(previous) = subscriptions.insert(topic.clone(), forwarder) {
                                    previous.abort();
                                }
                                control_message("subscribed", Some(&topic), None)
                            }
                            Ok(Command::Unsubscribe(topic)) => {
                                if let Some(forwarder) = subscriptions.remove(&topic) {
                                    forwarder.abort();
                                }
                                control_message("unsubscribed", Some(&topic), None)
                            }
                            Err(e) => control_message("error", None, Some(&e)),
                        };
                        if send_text(&mut sender, reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for (_, forwarder) in subscriptions.drain() {
        forwarder.abort();
    }
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_text(sender: &mut SplitSink<WebSocket, Message>, text: String) -> Result<(), axum::Error> {
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_subscription() {
        let id = JobId::new();
        let text = format!(r#"{{"type":"subscribe:job","id":"{id}"}}"#);
        assert_eq!(parse_command(&text), Ok(Command::Subscribe(Topic::Job(id))));
    }

    #[test]
    fn parses_project_unsubscription() {
        let text = r#"{"type":"unsubscribe:project","id":"chat-1"}"#;
        assert_eq!(
            parse_command(text),
            Ok(Command::Unsubscribe(Topic::Project("chat-1".to_string())))
        );
    }

    #[test]
    fn rejects_bad_messages() {
        assert!(parse_command("not json").is_err());
        assert!(parse_command(r#"{"type":"subscribe:job","id":"nope"}"#).is_err());
        assert!(parse_command(r#"{"type":"subscribe:build","id":"x"}"#).is_err());
        assert!(parse_command(r#"{"type":"listen:job","id":"x"}"#).is_err());
        assert!(parse_command(r#"{"type":"subscribe:project","id":""}"#).is_err());
    }
}
