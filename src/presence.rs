use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config;
use crate::events::{self, EventKind};

/// Local view: workspace -> user -> open connection count.
static LOCAL: Lazy<DashMap<Uuid, DashMap<Uuid, usize>>> = Lazy::new(DashMap::new);

/// Peer summaries keyed by instance id, merged with bounded staleness.
static REMOTE: Lazy<DashMap<Uuid, RemoteSummary>> = Lazy::new(DashMap::new);

struct RemoteSummary {
    received_at: DateTime<Utc>,
    workspaces: HashMap<Uuid, Vec<Uuid>>,
}

/// Record a connection. Returns true when this is the user's first open
/// connection in the workspace on this instance.
fn note_join(workspace_id: Uuid, user_id: Uuid) -> bool {
    let workspace = LOCAL.entry(workspace_id).or_default();
    let mut count = workspace.entry(user_id).or_insert(0);
    *count += 1;
    *count == 1
}

/// Record a disconnect. Returns true when the user's last connection in the
/// workspace on this instance closed.
fn note_leave(workspace_id: Uuid, user_id: Uuid) -> bool {
    let Some(workspace) = LOCAL.get(&workspace_id) else {
        return false;
    };
    let Some(mut count) = workspace.get_mut(&user_id) else {
        return false;
    };
    if *count > 1 {
        *count -= 1;
        return false;
    }
    drop(count);
    workspace.remove(&user_id);
    true
}

pub async fn join(pool: &PgPool, workspace_id: Uuid, user_id: Uuid) {
    if note_join(workspace_id, user_id) {
        publish_presence(pool, workspace_id, user_id, EventKind::PresenceJoin, "online").await;
    }
}

pub async fn leave(pool: &PgPool, workspace_id: Uuid, user_id: Uuid) {
    if note_leave(workspace_id, user_id) {
        publish_presence(pool, workspace_id, user_id, EventKind::PresenceLeave, "offline").await;
    }
}

async fn publish_presence(
    pool: &PgPool,
    workspace_id: Uuid,
    user_id: Uuid,
    kind: EventKind,
    status: &str,
) {
    if let Err(e) = events::publish(
        pool,
        events::workspace_topic(workspace_id),
        kind,
        json!({
            "workspace_id": workspace_id,
            "user_id": user_id,
            "status": status,
        }),
    )
    .await
    {
        tracing::warn!(?e, %workspace_id, %user_id, "presence publish failed");
    }
}

fn gossip_interval() -> Duration {
    Duration::seconds(*config::PRESENCE_GOSSIP_SECONDS as i64)
}

/// Merge a peer summary. Self-originated envelopes are dropped by the
/// caller; the local view already covers this instance.
fn apply_summary(instance_id: Uuid, workspaces: HashMap<Uuid, Vec<Uuid>>, now: DateTime<Utc>) {
    REMOTE.insert(
        instance_id,
        RemoteSummary {
            received_at: now,
            workspaces,
        },
    );
}

fn snapshot_at(workspace_id: Uuid, now: DateTime<Utc>) -> Vec<Uuid> {
    let stale_after = gossip_interval() * 3;
    let mut users: Vec<Uuid> = LOCAL
        .get(&workspace_id)
        .map(|ws| ws.iter().map(|entry| *entry.key()).collect())
        .unwrap_or_default();
    for entry in REMOTE.iter() {
        if now - entry.received_at > stale_after {
            continue;
        }
        if let Some(remote_users) = entry.workspaces.get(&workspace_id) {
            for user in remote_users {
                if !users.contains(user) {
                    users.push(*user);
                }
            }
        }
    }
    users.sort();
    users
}

/// Approximate, bounded-staleness occupancy: local view plus the union of
/// fresh peer summaries.
pub fn snapshot(workspace_id: Uuid) -> Vec<Uuid> {
    snapshot_at(workspace_id, Utc::now())
}

fn local_summary() -> HashMap<Uuid, Vec<Uuid>> {
    LOCAL
        .iter()
        .filter(|ws| !ws.is_empty())
        .map(|ws| (*ws.key(), ws.iter().map(|u| *u.key()).collect()))
        .collect()
}

/// Periodically publish this instance's occupancy on its control topic and
/// fold peer summaries into the remote view.
pub fn start_gossip(pool: PgPool) {
    let mut rx = events::subscribe(events::INSTANCE_WILDCARD);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if envelope.kind != EventKind::PresenceSummary
                        || envelope.origin_instance_id == *config::INSTANCE_ID
                    {
                        continue;
                    }
                    match serde_json::from_value::<HashMap<Uuid, Vec<Uuid>>>(
                        envelope.payload["workspaces"].clone(),
                    ) {
                        Ok(workspaces) => {
                            apply_summary(envelope.origin_instance_id, workspaces, Utc::now())
                        }
                        Err(e) => tracing::warn!(?e, "undecodable presence summary"),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "presence gossip receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(*config::PRESENCE_GOSSIP_SECONDS)).await;
            let summary = local_summary();
            if summary.is_empty() {
                continue;
            }
            if let Err(e) = events::publish(
                &pool,
                events::instance_topic(*config::INSTANCE_ID),
                EventKind::PresenceSummary,
                json!({ "workspaces": summary }),
            )
            .await
            {
                tracing::warn!(?e, "presence gossip publish failed");
            }
        }
    });
}
