//! WebSocket broker: the server → client event union and the per-user
//! fanout.
//!
//! Events ride a single broadcast channel as pre-serialized frames tagged
//! with an optional user id; each connection filters to broadcasts plus
//! frames addressed to its own user. A ping/pong keepalive detects dead
//! connections.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event union ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsEventType {
    #[serde(rename = "agent:init")]
    AgentInit,
    #[serde(rename = "agent:message")]
    AgentMessage,
    #[serde(rename = "agent:tool_call")]
    AgentToolCall,
    #[serde(rename = "agent:tool_output")]
    AgentToolOutput,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "agent:result")]
    AgentResult,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "command:output")]
    CommandOutput,
    #[serde(rename = "command:status")]
    CommandStatus,
    #[serde(rename = "automation:run_started")]
    AutomationRunStarted,
    #[serde(rename = "automation:run_completed")]
    AutomationRunCompleted,
    #[serde(rename = "git:status")]
    GitStatus,
    #[serde(rename = "pty:data")]
    PtyData,
    #[serde(rename = "pty:exit")]
    PtyExit,
    #[serde(rename = "thread:queue_update")]
    ThreadQueueUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: WsEventType,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    pub data: serde_json::Value,
}

impl WsEvent {
    pub fn new(event_type: WsEventType, thread_id: Option<i64>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            thread_id,
            data,
        }
    }

    pub fn for_thread(event_type: WsEventType, thread_id: i64, data: serde_json::Value) -> Self {
        Self::new(event_type, Some(thread_id), data)
    }
}

// ── Broker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Frame {
    /// None broadcasts to every connection.
    user_id: Option<String>,
    payload: String,
}

#[derive(Clone)]
pub struct WsBroker {
    tx: broadcast::Sender<Frame>,
}

impl Default for WsBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl WsBroker {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    /// Broadcast to all connections. Serialization failures and missing
    /// subscribers are both non-events.
    pub fn emit(&self, event: &WsEvent) {
        self.send(None, event);
    }

    /// Fan out only to connections tagged with this user.
    pub fn emit_to_user(&self, user_id: &str, event: &WsEvent) {
        self.send(Some(user_id.to_string()), event);
    }

    /// Emit per-user when the user is known, else broadcast.
    pub fn emit_scoped(&self, user_id: Option<&str>, event: &WsEvent) {
        match user_id {
            Some(user_id) => self.emit_to_user(user_id, event),
            None => self.emit(event),
        }
    }

    fn send(&self, user_id: Option<String>, event: &WsEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = self.tx.send(Frame { user_id, payload });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Drive one WebSocket connection until it drops.
    pub async fn run_connection(&self, socket: WebSocket, user_id: Option<String>) {
        let (sender, receiver) = socket.split();
        let rx = self.tx.subscribe();
        run_socket_loop(sender, receiver, rx, user_id).await;
    }
}

/// Core socket loop: frame forwarding, client receive, and ping/pong
/// health checking in a single select. Exits when the peer goes away or a
/// ping goes unanswered past [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Frame>,
    user_id: Option<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket pong timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        let addressed_to_us = match (&frame.user_id, &user_id) {
                            (None, _) => true,
                            (Some(target), Some(ours)) => target == ours,
                            (Some(_), None) => false,
                        };
                        if addressed_to_us
                            && sender.send(Message::Text(frame.payload.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => { /* clients only listen */ }
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_colon_type_and_camel_thread_id() {
        let event = WsEvent::for_thread(
            WsEventType::AgentToolCall,
            42,
            serde_json::json!({"name": "Bash"}),
        );
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "agent:tool_call");
        assert_eq!(json["threadId"], 42);
        assert_eq!(json["data"]["name"], "Bash");
    }

    #[test]
    fn threadless_event_omits_thread_id() {
        let event = WsEvent::new(
            WsEventType::AutomationRunStarted,
            None,
            serde_json::json!({"automationId": 1}),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("threadId"));
        assert!(json.contains("automation:run_started"));
    }

    #[test]
    fn all_event_types_round_trip() {
        for (variant, wire) in [
            (WsEventType::AgentInit, "agent:init"),
            (WsEventType::AgentMessage, "agent:message"),
            (WsEventType::AgentToolCall, "agent:tool_call"),
            (WsEventType::AgentToolOutput, "agent:tool_output"),
            (WsEventType::AgentStatus, "agent:status"),
            (WsEventType::AgentResult, "agent:result"),
            (WsEventType::AgentError, "agent:error"),
            (WsEventType::CommandOutput, "command:output"),
            (WsEventType::CommandStatus, "command:status"),
            (WsEventType::AutomationRunStarted, "automation:run_started"),
            (WsEventType::AutomationRunCompleted, "automation:run_completed"),
            (WsEventType::GitStatus, "git:status"),
            (WsEventType::PtyData, "pty:data"),
            (WsEventType::PtyExit, "pty:exit"),
            (WsEventType::ThreadQueueUpdate, "thread:queue_update"),
        ] {
            let json = serde_json::to_string(&variant).unwrap();
            assert_eq!(json, format!("\"{}\"", wire));
            let back: WsEventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, variant);
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let broker = WsBroker::new();
        broker.emit(&WsEvent::new(
            WsEventType::AgentStatus,
            Some(1),
            serde_json::json!({}),
        ));
        broker.emit_to_user(
            "user-1",
            &WsEvent::new(WsEventType::AgentStatus, Some(1), serde_json::json!({})),
        );
        assert_eq!(broker.subscriber_count(), 0);
    }
}
