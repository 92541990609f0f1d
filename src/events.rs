use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

/// Postgres NOTIFY channel carrying every event envelope.
pub const NOTIFY_CHANNEL: &str = "remix_events";

/// Pseudo-topic receiving a copy of every `instance.*` envelope, used for
/// presence gossip where the subscriber cannot know peer instance ids.
pub const INSTANCE_WILDCARD: &str = "instance.*";

const LOCAL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "transformation.started")]
    TransformationStarted,
    #[serde(rename = "transformation.progress")]
    TransformationProgress,
    #[serde(rename = "transformation.completed")]
    TransformationCompleted,
    #[serde(rename = "transformation.failed")]
    TransformationFailed,
    #[serde(rename = "presence.join")]
    PresenceJoin,
    #[serde(rename = "presence.leave")]
    PresenceLeave,
    #[serde(rename = "presence.summary")]
    PresenceSummary,
    #[serde(rename = "workspace.message")]
    WorkspaceMessage,
}

impl EventKind {
    /// Terminal transformation events are never dropped under backpressure.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::TransformationCompleted | EventKind::TransformationFailed
        )
    }
}

/// Wire format on the event fabric. Consumers tolerate duplicates;
/// `emitted_at` is monotonic per topic per origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub topic: String,
    pub kind: EventKind,
    pub payload: Value,
    pub origin_instance_id: Uuid,
    pub emitted_at: DateTime<Utc>,
}

pub fn workspace_topic(workspace_id: Uuid) -> String {
    format!("ws.{workspace_id}")
}

pub fn user_topic(workspace_id: Uuid, user_id: Uuid) -> String {
    format!("ws.{workspace_id}.user.{user_id}")
}

pub fn instance_topic(instance_id: Uuid) -> String {
    format!("instance.{instance_id}")
}

static CHANNELS: Lazy<DashMap<String, broadcast::Sender<EventEnvelope>>> = Lazy::new(DashMap::new);

/// Subscribe to a topic's local fan-out channel.
pub fn subscribe(topic: &str) -> broadcast::Receiver<EventEnvelope> {
    use dashmap::mapref::entry::Entry;
    match CHANNELS.entry(topic.to_string()) {
        Entry::Occupied(e) => e.get().subscribe(),
        Entry::Vacant(v) => {
            let (tx, rx) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
            v.insert(tx);
            rx
        }
    }
}

/// Deliver an envelope to local subscribers. Only the broker listener calls
/// this on the live path; fan-out always rides the broker so delivery is
/// uniform whether the publisher is this instance or a peer.
pub fn dispatch_local(envelope: EventEnvelope) {
    if envelope.topic.starts_with("instance.") {
        if let Some(tx) = CHANNELS.get(INSTANCE_WILDCARD) {
            let _ = tx.send(envelope.clone());
        }
    }
    if let Some(tx) = CHANNELS.get(&envelope.topic) {
        let _ = tx.send(envelope);
    }
}

/// Publish an envelope onto the broker. Retried 3x; at-least-once.
pub async fn publish(pool: &PgPool, topic: String, kind: EventKind, payload: Value) -> AppResult<()> {
    let envelope = EventEnvelope {
        topic,
        kind,
        payload,
        origin_instance_id: *config::INSTANCE_ID,
        emitted_at: Utc::now(),
    };
    let json = serde_json::to_string(&envelope)
        .map_err(|e| AppError::Message(format!("event serialization failed: {e}")))?;
    let mut last_err = None;
    for attempt in 1..=3u64 {
        match sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(&json)
            .execute(pool)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::warn!(?e, attempt, topic = %envelope.topic, "event publish failed");
                last_err = Some(e);
                sleep(Duration::from_millis(50 * attempt)).await;
            }
        }
    }
    Err(AppError::Db(last_err.unwrap_or(sqlx::Error::PoolClosed)))
}

/// Spawn the broker listener: receives every envelope published on
/// `NOTIFY_CHANNEL` (from this instance and peers) and fans it into the
/// local per-topic channels. Reconnects on listener failure.
pub fn start_listener(pool: PgPool) {
    tokio::spawn(async move {
        loop {
            match PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
                        tracing::error!(?e, "failed to LISTEN on event channel");
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    tracing::info!(channel = NOTIFY_CHANNEL, "event listener attached");
                    loop {
                        match listener.recv().await {
                            Ok(notification) => {
                                match serde_json::from_str::<EventEnvelope>(notification.payload()) {
                                    Ok(envelope) => dispatch_local(envelope),
                                    Err(e) => {
                                        tracing::warn!(?e, "undecodable event envelope dropped")
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(?e, "event listener connection lost; reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(?e, "event listener failed to connect");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}
