use once_cell::sync::Lazy;
use std::collections::HashMap;
use uuid::Uuid;

/// Secret used for access-token signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server binds to. Defaults to `8000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
});

/// Identifier of this process instance, stamped on every published event.
pub static INSTANCE_ID: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

/// Lifetime of access tokens in seconds. Defaults to 15 minutes.
pub static ACCESS_TTL_SECONDS: Lazy<i64> = Lazy::new(|| env_i64("ACCESS_TTL_SECONDS", 900));

/// Lifetime of refresh tokens in seconds. Defaults to 14 days.
pub static REFRESH_TTL_SECONDS: Lazy<i64> =
    Lazy::new(|| env_i64("REFRESH_TTL_SECONDS", 14 * 24 * 3600));

/// Number of transformation workers. Defaults to 2.
pub static WORKER_CONCURRENCY: Lazy<usize> =
    Lazy::new(|| env_i64("WORKER_CONCURRENCY", 2).max(1) as usize);

/// Seconds a claimed task is leased to a worker before it becomes reclaimable.
pub static CLAIM_LEASE_SECONDS: Lazy<i64> = Lazy::new(|| env_i64("CLAIM_LEASE_SECONDS", 60));

/// Maximum delivery attempts for a queued task before it fails terminally.
pub static MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| env_i64("MAX_ATTEMPTS", 3) as i32);

/// Base delay for the exponential retry backoff, in milliseconds.
pub static BACKOFF_BASE_MS: Lazy<i64> = Lazy::new(|| env_i64("BACKOFF_BASE_MS", 2000));

/// Exponent cap for the retry backoff.
pub const BACKOFF_EXP_CAP: u32 = 6;

/// Hard timeout applied to every provider invocation, in seconds.
pub static PROVIDER_TIMEOUT_SECONDS: Lazy<u64> =
    Lazy::new(|| env_i64("PROVIDER_TIMEOUT_SECONDS", 120) as u64);

/// Consecutive failures before a provider's breaker opens.
pub static BREAKER_FAILURE_THRESHOLD: Lazy<u32> =
    Lazy::new(|| env_i64("BREAKER_FAILURE_THRESHOLD", 3) as u32);

/// Seconds an open breaker waits before allowing a half-open probe.
pub static BREAKER_COOLDOWN_SECONDS: Lazy<i64> =
    Lazy::new(|| env_i64("BREAKER_COOLDOWN_SECONDS", 30));

/// Ordered provider preference list, comma separated.
pub static PROVIDER_ORDER: Lazy<Vec<String>> = Lazy::new(|| {
    std::env::var("PROVIDER_ORDER")
        .unwrap_or_else(|_| "openai,anthropic".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
});

pub static OPENAI_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("OPENAI_API_KEY").ok());

pub static ANTHROPIC_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("ANTHROPIC_API_KEY").ok());

pub static OPENAI_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| "https://api.openai.com".to_string())
});

pub static ANTHROPIC_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("ANTHROPIC_API_BASE").unwrap_or_else(|_| "https://api.anthropic.com".to_string())
});

/// Directory backing the content-addressed blob store.
pub static BLOB_STORE_DIR: Lazy<String> =
    Lazy::new(|| std::env::var("BLOB_STORE_DIR").unwrap_or_else(|_| "storage/blobs".to_string()));

/// Interval between server-side websocket heartbeats, in seconds.
pub static WS_HEARTBEAT_SECONDS: Lazy<u64> =
    Lazy::new(|| env_i64("WS_HEARTBEAT_SECONDS", 30) as u64);

/// Interval between presence gossip summaries, in seconds.
pub static PRESENCE_GOSSIP_SECONDS: Lazy<u64> =
    Lazy::new(|| env_i64("PRESENCE_GOSSIP_SECONDS", 15) as u64);

/// Upper bound on uploaded document size, in bytes.
pub static MAX_UPLOAD_BYTES: Lazy<usize> =
    Lazy::new(|| env_i64("MAX_UPLOAD_BYTES", 25 * 1024 * 1024) as usize);

/// Database pool size. Sized to roughly twice the concurrent request ceiling.
pub static DB_POOL_SIZE: Lazy<u32> = Lazy::new(|| env_i64("DB_POOL_SIZE", 10) as u32);

/// Per-bucket fixed-window rate limits, parsed from `RATE_LIMITS` as
/// `bucket=count` pairs separated by commas, e.g. `login=10,upload=20`.
pub static RATE_LIMITS: Lazy<HashMap<String, u32>> = Lazy::new(|| {
    let mut limits: HashMap<String, u32> = [
        ("register", 5u32),
        ("login", 10),
        ("refresh", 30),
        ("upload", 20),
        ("transformations", 30),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    if let Ok(raw) = std::env::var("RATE_LIMITS") {
        for pair in raw.split(',') {
            if let Some((bucket, count)) = pair.split_once('=') {
                if let Ok(count) = count.trim().parse() {
                    limits.insert(bucket.trim().to_string(), count);
                }
            }
        }
    }
    limits
});

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
