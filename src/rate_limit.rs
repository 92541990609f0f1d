use dashmap::DashMap;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

const WINDOW_SECONDS: i64 = 60;

static WINDOWS: Lazy<DashMap<(Uuid, String), (i64, u32)>> = Lazy::new(DashMap::new);

/// Fixed-window counter keyed by `(workspace_id, bucket)`. Unauthenticated
/// routes pass the nil workspace id.
pub fn check(workspace_id: Uuid, bucket: &str) -> AppResult<()> {
    check_at(workspace_id, bucket, chrono::Utc::now().timestamp())
}

fn check_at(workspace_id: Uuid, bucket: &str, now: i64) -> AppResult<()> {
    let limit = match crate::config::RATE_LIMITS.get(bucket) {
        Some(limit) => *limit,
        None => return Ok(()),
    };
    let window = now / WINDOW_SECONDS;
    let mut entry = WINDOWS
        .entry((workspace_id, bucket.to_string()))
        .or_insert((window, 0));
    let (entry_window, count) = *entry;
    if entry_window != window {
        *entry = (window, 1);
        return Ok(());
    }
    if count >= limit {
        tracing::warn!(%workspace_id, bucket, "rate limit exceeded");
        return Err(AppError::Throttled);
    }
    *entry = (window, count + 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_enforced_within_window() {
        let ws = Uuid::new_v4();
        let limit = *crate::config::RATE_LIMITS.get("login").unwrap();
        for _ in 0..limit {
            check_at(ws, "login", 1_000_000).unwrap();
        }
        assert!(matches!(
            check_at(ws, "login", 1_000_000),
            Err(AppError::Throttled)
        ));
    }

    #[test]
    fn window_rollover_resets() {
        let ws = Uuid::new_v4();
        let limit = *crate::config::RATE_LIMITS.get("login").unwrap();
        for _ in 0..limit {
            check_at(ws, "login", 2_000_000).unwrap();
        }
        assert!(check_at(ws, "login", 2_000_000 + WINDOW_SECONDS).is_ok());
    }

    #[test]
    fn unknown_bucket_unlimited() {
        let ws = Uuid::new_v4();
        for _ in 0..10_000 {
            check_at(ws, "unconfigured", 3_000_000).unwrap();
        }
    }

    #[test]
    fn workspaces_counted_independently() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let limit = *crate::config::RATE_LIMITS.get("upload").unwrap();
        for _ in 0..limit {
            check_at(a, "upload", 4_000_000).unwrap();
        }
        assert!(check_at(b, "upload", 4_000_000).is_ok());
    }
}
