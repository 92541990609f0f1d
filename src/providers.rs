use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::Mutex;
use thiserror::Error;

use crate::config;
use crate::transformations::TransformationKind;

/// Input to one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub kind: TransformationKind,
    pub parameters: Value,
    /// Extracted text of the source document, when the job references one.
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// Transient failures step the breaker and allow failover to the next
/// provider; deterministic failures stop the failover loop.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rejected request: {0}")]
    Deterministic(String),
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, kind: TransformationKind) -> bool;
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError>;
}

/// Render the per-kind instructions sent to every provider.
pub fn render_instructions(request: &ProviderRequest) -> (String, String) {
    let system = "You are a content repurposing assistant. Produce only the requested \
                  content, ready to publish, with no preamble."
        .to_string();
    let params = &request.parameters;
    let task = match request.kind {
        TransformationKind::BlogPost => format!(
            "Write a blog post of about {} words in a {} tone.",
            params["word_count"], params["tone"]
        ),
        TransformationKind::SocialMedia => format!(
            "Write {} social media posts for {}.",
            params["post_count"], params["platform"]
        ),
        TransformationKind::EmailSequence => format!(
            "Write an email sequence of {} emails.",
            params["email_count"]
        ),
        TransformationKind::Newsletter => format!(
            "Write a newsletter with these sections: {}.",
            params["sections"]
        ),
        TransformationKind::Summary => format!(
            "Summarize the content in about {} words.",
            params["length"]
        ),
        TransformationKind::Custom => format!("{}", params["custom_instructions"]),
    };
    let user = match &request.source {
        Some(source) => format!("{task}\n\nSource content:\n\n{source}"),
        None => task,
    };
    (system, user)
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("transport: {e}"))
}

fn status_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(format!("status {status}"))
    } else {
        // Payload detail stays out of user-visible errors; log-side only.
        tracing::debug!(%status, body, "provider rejected request");
        ProviderError::Deterministic(format!("status {status}"))
    }
}

pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, api_key: String, base_url: String) -> Self {
        Self {
            name: name.into(),
            client: http_client(),
            api_key,
            base_url,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _kind: TransformationKind) -> bool {
        true
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let (system, user) = render_instructions(request);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed response: {e}")))?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Transient("response missing content".into()))?
            .to_string();
        Ok(ProviderOutput {
            text,
            tokens_in: body["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            tokens_out: body["usage"]["completion_tokens"].as_i64().unwrap_or(0),
        })
    }
}

pub struct AnthropicProvider {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, api_key: String, base_url: String) -> Self {
        Self {
            name: name.into(),
            client: http_client(),
            api_key,
            base_url,
            model: "claude-3-5-sonnet-20241022".to_string(),
        }
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _kind: TransformationKind) -> bool {
        true
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let (system, user) = render_instructions(request);
        let body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed response: {e}")))?;
        let text = body["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::Transient("response missing content".into()))?
            .to_string();
        Ok(ProviderOutput {
            text,
            tokens_in: body["usage"]["input_tokens"].as_i64().unwrap_or(0),
            tokens_out: body["usage"]["output_tokens"].as_i64().unwrap_or(0),
        })
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(*config::PROVIDER_TIMEOUT_SECONDS))
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// Per-provider circuit breaker: opens after a run of consecutive failures,
/// probes again after a cool-down, closes on success.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold,
            cooldown,
        }
    }

    /// Whether an attempt may proceed now. An open breaker whose cool-down
    /// elapsed moves to half-open and admits the probe.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now - at >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UsageCounters {
    pub invocations: i64,
    pub failures: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

struct ProviderEntry {
    provider: Arc<dyn AiProvider>,
    breaker: CircuitBreaker,
    counters: Mutex<UsageCounters>,
}

/// Ordered provider set with breaker state and usage counters. Counters are
/// authoritative in-process and replicated best-effort to `provider_state`
/// for cross-instance visibility.
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
    pool: Option<PgPool>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn AiProvider>>, pool: Option<PgPool>) -> Self {
        let entries = providers
            .into_iter()
            .map(|provider| ProviderEntry {
                provider,
                breaker: CircuitBreaker::new(
                    *config::BREAKER_FAILURE_THRESHOLD,
                    Duration::seconds(*config::BREAKER_COOLDOWN_SECONDS),
                ),
                counters: Mutex::new(UsageCounters::default()),
            })
            .collect();
        Self { entries, pool }
    }

    /// Build adapters for every configured name in `PROVIDER_ORDER` whose
    /// credentials are present.
    pub fn from_config(pool: PgPool) -> Self {
        let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
        for name in config::PROVIDER_ORDER.iter() {
            match name.as_str() {
                "openai" => match config::OPENAI_API_KEY.clone() {
                    Some(key) => providers.push(Arc::new(OpenAiProvider::new(
                        name.clone(),
                        key,
                        config::OPENAI_API_BASE.clone(),
                    ))),
                    None => tracing::warn!("openai configured in PROVIDER_ORDER but OPENAI_API_KEY unset"),
                },
                "anthropic" => match config::ANTHROPIC_API_KEY.clone() {
                    Some(key) => providers.push(Arc::new(AnthropicProvider::new(
                        name.clone(),
                        key,
                        config::ANTHROPIC_API_BASE.clone(),
                    ))),
                    None => tracing::warn!(
                        "anthropic configured in PROVIDER_ORDER but ANTHROPIC_API_KEY unset"
                    ),
                },
                other => tracing::warn!(provider = other, "unknown provider in PROVIDER_ORDER"),
            }
        }
        if providers.is_empty() {
            tracing::warn!("no AI providers configured; transformations will fail");
        }
        Self::new(providers, Some(pool))
    }

    /// Providers eligible for a kind, in configured order, skipping open
    /// breakers (an elapsed cool-down admits a half-open probe).
    pub fn candidates(&self, kind: TransformationKind) -> Vec<Arc<dyn AiProvider>> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| entry.provider.supports(kind) && entry.breaker.try_acquire(now))
            .map(|entry| Arc::clone(&entry.provider))
            .collect()
    }

    pub fn record_success(&self, name: &str, tokens_in: i64, tokens_out: i64) {
        if let Some(entry) = self.entry(name) {
            entry.breaker.record_success();
            {
                let mut counters = entry.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.invocations += 1;
                counters.tokens_in += tokens_in;
                counters.tokens_out += tokens_out;
            }
            self.replicate(entry);
        }
    }

    pub fn record_failure(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            entry.breaker.record_failure(Utc::now());
            {
                let mut counters = entry.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.invocations += 1;
                counters.failures += 1;
            }
            self.replicate(entry);
        }
    }

    pub fn breaker_state(&self, name: &str) -> Option<BreakerState> {
        self.entry(name).map(|entry| entry.breaker.state())
    }

    pub fn usage(&self, name: &str) -> Option<UsageCounters> {
        self.entry(name)
            .map(|entry| *entry.counters.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.provider.name() == name)
    }

    /// Best-effort cross-instance replication; mild under-counting under
    /// failure is acceptable.
    fn replicate(&self, entry: &ProviderEntry) {
        let Some(pool) = self.pool.clone() else {
            return;
        };
        let name = entry.provider.name().to_string();
        let state = entry.breaker.state().as_str();
        let failures = entry.breaker.consecutive_failures() as i32;
        let counters = *entry.counters.lock().unwrap_or_else(|e| e.into_inner());
        tokio::spawn(async move {
            let result = sqlx::query(
                "INSERT INTO provider_state \
                     (provider, breaker_state, consecutive_failures, invocations, failures, \
                      tokens_in, tokens_out, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
                 ON CONFLICT (provider) DO UPDATE SET \
                     breaker_state = EXCLUDED.breaker_state, \
                     consecutive_failures = EXCLUDED.consecutive_failures, \
                     invocations = EXCLUDED.invocations, \
                     failures = EXCLUDED.failures, \
                     tokens_in = EXCLUDED.tokens_in, \
                     tokens_out = EXCLUDED.tokens_out, \
                     updated_at = now()",
            )
            .bind(&name)
            .bind(state)
            .bind(failures)
            .bind(counters.invocations)
            .bind(counters.failures)
            .bind(counters.tokens_in)
            .bind(counters.tokens_out)
            .execute(&pool)
            .await;
            if let Err(e) = result {
                tracing::warn!(?e, provider = %name, "provider state replication failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        name: &'static str,
    }

    #[async_trait]
    impl AiProvider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn supports(&self, _kind: TransformationKind) -> bool {
            true
        }
        async fn invoke(&self, _request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            Ok(ProviderOutput {
                text: "ok".into(),
                tokens_in: 1,
                tokens_out: 1,
            })
        }
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::seconds(30));
        let now = Utc::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire(now));
    }

    #[test]
    fn breaker_half_opens_after_cooldown_and_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::seconds(30));
        let now = Utc::now();
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire(now + Duration::seconds(31)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(3, Duration::seconds(30));
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        assert!(breaker.try_acquire(now + Duration::seconds(31)));
        breaker.record_failure(now + Duration::seconds(32));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire(now + Duration::seconds(33)));
    }

    #[test]
    fn success_resets_failure_run() {
        let breaker = CircuitBreaker::new(3, Duration::seconds(30));
        let now = Utc::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn registry_skips_open_breaker_in_order() {
        let registry = ProviderRegistry::new(
            vec![
                Arc::new(StaticProvider { name: "first" }),
                Arc::new(StaticProvider { name: "second" }),
            ],
            None,
        );
        let candidates = registry.candidates(TransformationKind::Summary);
        assert_eq!(candidates[0].name(), "first");
        assert_eq!(candidates[1].name(), "second");

        for _ in 0..*config::BREAKER_FAILURE_THRESHOLD {
            registry.record_failure("first");
        }
        assert_eq!(registry.breaker_state("first"), Some(BreakerState::Open));
        let candidates = registry.candidates(TransformationKind::Summary);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "second");
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let registry =
            ProviderRegistry::new(vec![Arc::new(StaticProvider { name: "p" })], None);
        registry.record_success("p", 10, 20);
        registry.record_success("p", 1, 2);
        registry.record_failure("p");
        let usage = registry.usage("p").unwrap();
        assert_eq!(usage.invocations, 3);
        assert_eq!(usage.failures, 1);
        assert_eq!(usage.tokens_in, 11);
        assert_eq!(usage.tokens_out, 22);
    }

    #[test]
    fn instructions_carry_parameters_and_source() {
        let request = ProviderRequest {
            kind: TransformationKind::BlogPost,
            parameters: json!({"word_count": 500, "tone": "casual"}),
            source: Some("Original article text".into()),
        };
        let (_, user) = render_instructions(&request);
        assert!(user.contains("500"));
        assert!(user.contains("casual"));
        assert!(user.contains("Original article text"));
    }
}
