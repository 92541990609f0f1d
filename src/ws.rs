use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use uuid::Uuid;

use crate::config;
use crate::events::{self, EventEnvelope, EventKind};
use crate::extractor::{authorize_claims, decode_access_claims, Subject, TokenFailure};
use crate::presence;

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_TOKEN_EXPIRED: u16 = 4401;
const SEND_QUEUE_CAPACITY: usize = 64;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: String,
    pub workspace_id: Uuid,
}

/// Frame sent to clients: `{type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerFrame {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Map a bus envelope to its client frame. Control-plane envelopes carry no
/// client representation.
pub fn frame_for(envelope: &EventEnvelope) -> Option<ServerFrame> {
    let kind = match envelope.kind {
        EventKind::TransformationStarted => "transformation_started",
        EventKind::TransformationProgress => "transformation_progress",
        EventKind::TransformationCompleted => "transformation_completed",
        EventKind::TransformationFailed => "transformation_failed",
        EventKind::PresenceJoin | EventKind::PresenceLeave => "presence_update",
        EventKind::WorkspaceMessage => "workspace_message",
        EventKind::PresenceSummary => return None,
    };
    Some(ServerFrame {
        kind: kind.to_string(),
        data: envelope.payload.clone(),
        timestamp: envelope.emitted_at,
    })
}

struct QueuedFrame {
    frame: ServerFrame,
    terminal: bool,
}

/// Bounded per-session send queue. When full, the oldest non-terminal frame
/// is dropped; terminal transformation frames are never dropped, even if
/// that means briefly exceeding capacity.
pub struct SendQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
    dropped: u64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: ServerFrame, terminal: bool) {
        if self.frames.len() >= self.capacity {
            if let Some(pos) = self.frames.iter().position(|f| !f.terminal) {
                self.frames.remove(pos);
                self.dropped += 1;
            }
        }
        self.frames.push_back(QueuedFrame { frame, terminal });
    }

    pub fn pop(&mut self) -> Option<ServerFrame> {
        self.frames.pop_front().map(|f| f.frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    Extension(pool): Extension<PgPool>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, pool, query))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, pool: PgPool, query: WsQuery) {
    let claims = match decode_access_claims(&query.token) {
        Ok(claims) => claims,
        Err(TokenFailure::Expired) => {
            return close_with(socket, CLOSE_TOKEN_EXPIRED, "token expired").await;
        }
        Err(TokenFailure::Invalid) => {
            return close_with(socket, CLOSE_POLICY_VIOLATION, "unauthorized").await;
        }
    };
    let subject = match authorize_claims(&pool, &claims).await {
        Ok(subject) => subject,
        Err(_) => return close_with(socket, CLOSE_POLICY_VIOLATION, "unauthorized").await,
    };
    // The handshake's target workspace must agree with the credential.
    if subject.workspace_id != query.workspace_id {
        return close_with(socket, CLOSE_POLICY_VIOLATION, "workspace mismatch").await;
    }
    run_session(socket, pool, subject).await;
}

async fn run_session(socket: WebSocket, pool: PgPool, subject: Subject) {
    let workspace_id = subject.workspace_id;
    let user_id = subject.user_id;
    let (mut sender, receiver) = socket.split();

    let hello = ServerFrame::new(
        "connection_established",
        json!({
            "workspace_id": workspace_id,
            "user_id": user_id,
        }),
    );
    if send_frame(&mut sender, &hello).await.is_err() {
        return;
    }

    presence::join(&pool, workspace_id, user_id).await;

    let workspace_rx = events::subscribe(&events::workspace_topic(workspace_id));
    let user_rx = events::subscribe(&events::user_topic(workspace_id, user_id));
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<ServerFrame>(16);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Two cooperative halves joined by cancellation: the writer drains the
    // bus and the send queue, the reader drives client frames. Whichever
    // finishes first tears the session down.
    let writer = tokio::spawn(writer_loop(
        sender,
        workspace_rx,
        user_rx,
        ctrl_rx,
        last_pong.clone(),
    ));
    reader_loop(receiver, pool.clone(), subject, ctrl_tx, last_pong).await;
    writer.abort();

    presence::leave(&pool, workspace_id, user_id).await;
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(text)).await
}

async fn writer_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut workspace_rx: tokio::sync::broadcast::Receiver<EventEnvelope>,
    mut user_rx: tokio::sync::broadcast::Receiver<EventEnvelope>,
    mut ctrl_rx: mpsc::Receiver<ServerFrame>,
    last_pong: Arc<Mutex<Instant>>,
) {
    use tokio::sync::broadcast::error::RecvError;

    let heartbeat_period = Duration::from_secs(*config::WS_HEARTBEAT_SECONDS);
    let mut heartbeat = interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut queue = SendQueue::new(SEND_QUEUE_CAPACITY);

    loop {
        while let Some(frame) = queue.pop() {
            if send_frame(&mut sender, &frame).await.is_err() {
                return;
            }
        }
        tokio::select! {
            envelope = workspace_rx.recv() => match envelope {
                Ok(envelope) => enqueue_envelope(&mut queue, &envelope),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "workspace event stream lagged");
                }
                Err(RecvError::Closed) => return,
            },
            envelope = user_rx.recv() => match envelope {
                Ok(envelope) => enqueue_envelope(&mut queue, &envelope),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "user event stream lagged");
                }
                Err(RecvError::Closed) => return,
            },
            frame = ctrl_rx.recv() => match frame {
                Some(frame) => queue.push(frame, false),
                None => return,
            },
            _ = heartbeat.tick() => {
                let idle = last_pong.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
                if idle > heartbeat_period * 2 {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    return;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn enqueue_envelope(queue: &mut SendQueue, envelope: &EventEnvelope) {
    if let Some(frame) = frame_for(envelope) {
        let dropped_before = queue.dropped();
        queue.push(frame, envelope.kind.is_terminal());
        if queue.dropped() > dropped_before {
            tracing::debug!(dropped = queue.dropped(), "session backpressure drop");
        }
    }
}

async fn reader_loop(
    mut receiver: SplitStream<WebSocket>,
    pool: PgPool,
    subject: Subject,
    ctrl_tx: mpsc::Sender<ServerFrame>,
    last_pong: Arc<Mutex<Instant>>,
) {
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    let _ = ctrl_tx
                        .send(ServerFrame::new("error", json!({"detail": "malformed frame"})))
                        .await;
                    continue;
                };
                handle_client_frame(&pool, &subject, &ctrl_tx, frame).await;
            }
            Message::Pong(_) => {
                *last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_client_frame(
    pool: &PgPool,
    subject: &Subject,
    ctrl_tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame.kind.as_str() {
        "ping" => {
            let _ = ctrl_tx.send(ServerFrame::new("pong", json!({}))).await;
        }
        "get_workspace_presence" => {
            let users = presence::snapshot(subject.workspace_id);
            let _ = ctrl_tx
                .send(ServerFrame::new(
                    "workspace_presence",
                    json!({
                        "workspace_id": subject.workspace_id,
                        "users": users,
                    }),
                ))
                .await;
        }
        "workspace_message" => {
            let message = frame.data["message"].as_str().unwrap_or_default();
            if message.len() > 2000 {
                let _ = ctrl_tx
                    .send(ServerFrame::new("error", json!({"detail": "message too long"})))
                    .await;
                return;
            }
            if message.is_empty() {
                let _ = ctrl_tx
                    .send(ServerFrame::new("error", json!({"detail": "empty message"})))
                    .await;
                return;
            }
            if let Err(e) = events::publish(
                pool,
                events::workspace_topic(subject.workspace_id),
                EventKind::WorkspaceMessage,
                json!({
                    "workspace_id": subject.workspace_id,
                    "from_user_id": subject.user_id,
                    "message": message,
                }),
            )
            .await
            {
                tracing::warn!(?e, "workspace message publish failed");
            }
        }
        other => {
            let _ = ctrl_tx
                .send(ServerFrame::new(
                    "error",
                    json!({"detail": format!("unknown frame type {other}")}),
                ))
                .await;
        }
    }
}
