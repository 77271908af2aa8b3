use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error};

use nodegraph_core::config::{DispatchPolicy, OrchestrationConfig};
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::llm::{LlmBackend, LlmRequest, LlmResponse};

use crate::error_cache::{ErrorCache, ErrorCacheEntry};

/// Case-insensitive substrings that mark a text reply as a failure.
const FAILURE_SIGNALS: [&str; 8] = [
    "error",
    "exception",
    "failed",
    "authentication",
    "rate limit",
    "api key",
    "unauthorized",
    "forbidden",
];

/// Text replies shorter than this (in characters) are treated as failures.
const MIN_PLAUSIBLE_CHARS: usize = 100;

/// Characters of the request echoed into failure logs.
const LOG_INPUT_CHARS: usize = 500;

pub fn looks_like_failure(text: &str) -> bool {
    if text.chars().count() < MIN_PLAUSIBLE_CHARS {
        return true;
    }
    let lower = text.to_lowercase();
    FAILURE_SIGNALS.iter().any(|signal| lower.contains(signal))
}

/// Result of one orchestrated call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Structured(serde_json::Value),
    Raw(String),
    /// The call failed and was written to the failure cache for replay.
    Cached,
}

impl CallOutcome {
    pub fn into_structured(self) -> Option<serde_json::Value> {
        match self {
            CallOutcome::Structured(v) => Some(v),
            _ => None,
        }
    }
}

/// Enforces a minimum spacing between dispatches. The read of the previous
/// dispatch time, the wait and the update form one critical section.
struct Pacer {
    delay: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_dispatch: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Bounded, paced, failure-classifying wrapper around an [`LlmBackend`].
///
/// Responses are not returned in dispatch order.
pub struct OrchestrationClient {
    backend: Arc<dyn LlmBackend>,
    policy: DispatchPolicy,
    in_flight: Semaphore,
    pacer: Pacer,
    dispatched: AtomicU64,
    cached_failures: AtomicU64,
}

impl OrchestrationClient {
    pub fn new(backend: Arc<dyn LlmBackend>, config: &OrchestrationConfig) -> Self {
        Self {
            backend,
            policy: config.dispatch,
            in_flight: Semaphore::new(config.dispatch.max_in_flight()),
            pacer: Pacer::new(config.request_delay),
            dispatched: AtomicU64::new(0),
            cached_failures: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn cached_failures(&self) -> u64 {
        self.cached_failures.load(Ordering::Relaxed)
    }

    /// Call the backend. A classified failure is cached and reported as
    /// [`CallOutcome::Cached`] when both `cache` and `metadata` are given;
    /// otherwise it is returned as [`NodeGraphError::Llm`]. Structured
    /// responses are never classified.
    pub async fn call(
        &self,
        request: &LlmRequest,
        cache: Option<&ErrorCache>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<CallOutcome> {
        let response = {
            let _permit = self
                .in_flight
                .acquire()
                .await
                .map_err(|_| NodeGraphError::Internal("LLM dispatch semaphore closed".into()))?;
            self.pacer.wait_turn().await;
            self.dispatched.fetch_add(1, Ordering::Relaxed);

            debug!(
                backend = self.backend.name(),
                schema = ?request.response_format,
                query_len = request.query.len(),
                "Dispatching LLM call"
            );
            self.backend.generate(request).await?
        };

        match response {
            LlmResponse::Structured(value) => Ok(CallOutcome::Structured(value)),
            LlmResponse::Raw(text) if !looks_like_failure(&text) => Ok(CallOutcome::Raw(text)),
            LlmResponse::Raw(text) | LlmResponse::Failure(text) => {
                self.handle_failure(request, text, cache, metadata).await
            }
        }
    }

    async fn handle_failure(
        &self,
        request: &LlmRequest,
        reply: String,
        cache: Option<&ErrorCache>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<CallOutcome> {
        let input: String = request.query.chars().take(LOG_INPUT_CHARS).collect();
        error!(reply = %reply, input = %input, "LLM call failed");

        match (cache, metadata) {
            (Some(cache), Some(metadata)) => {
                cache
                    .append(&ErrorCacheEntry::new(request, metadata.clone()))
                    .await?;
                self.cached_failures.fetch_add(1, Ordering::Relaxed);
                Ok(CallOutcome::Cached)
            }
            _ => Err(NodeGraphError::Llm(reply)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nodegraph_core::llm::ResponseSchema;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FixedBackend {
        reply: LlmResponse,
        hold: Duration,
        dispatch_times: std::sync::Mutex<Vec<Instant>>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FixedBackend {
        fn new(reply: LlmResponse) -> Self {
            Self {
                reply,
                hold: Duration::ZERO,
                dispatch_times: std::sync::Mutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn holding(mut self, hold: Duration) -> Self {
            self.hold = hold;
            self
        }
    }

    #[async_trait]
    impl LlmBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse> {
            self.dispatch_times.lock().unwrap().push(Instant::now());
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.hold.is_zero() {
                tokio::time::sleep(self.hold).await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn config(dispatch: DispatchPolicy, delay: Duration) -> OrchestrationConfig {
        OrchestrationConfig {
            dispatch,
            request_delay: delay,
        }
    }

    fn plain_text(len: usize) -> String {
        "a".repeat(len)
    }

    #[test]
    fn test_length_boundary() {
        assert!(looks_like_failure(&plain_text(99)));
        assert!(!looks_like_failure(&plain_text(100)));
    }

    #[test]
    fn test_keyword_signals_are_case_insensitive() {
        let body = format!("{} Rate Limit reached", plain_text(120));
        assert!(looks_like_failure(&body));
        let body = format!("{} UNAUTHORIZED", plain_text(120));
        assert!(looks_like_failure(&body));
    }

    #[tokio::test]
    async fn test_structured_passes_through_unclassified() {
        let backend = Arc::new(FixedBackend::new(LlmResponse::Structured(json!({"error": 1}))));
        let client = OrchestrationClient::new(backend, &config(DispatchPolicy::SingleFlight, Duration::ZERO));

        let outcome = client.call(&LlmRequest::text("q"), None, None).await.unwrap();
        assert_eq!(outcome, CallOutcome::Structured(json!({"error": 1})));
    }

    #[tokio::test]
    async fn test_plausible_raw_text_is_returned() {
        let backend = Arc::new(FixedBackend::new(LlmResponse::Raw(plain_text(100))));
        let client = OrchestrationClient::new(backend, &config(DispatchPolicy::SingleFlight, Duration::ZERO));

        let outcome = client.call(&LlmRequest::text("q"), None, None).await.unwrap();
        assert_eq!(outcome, CallOutcome::Raw(plain_text(100)));
    }

    #[tokio::test]
    async fn test_short_reply_without_cache_raises() {
        let backend = Arc::new(FixedBackend::new(LlmResponse::Raw(plain_text(99))));
        let client = OrchestrationClient::new(backend, &config(DispatchPolicy::SingleFlight, Duration::ZERO));

        let err = client.call(&LlmRequest::text("q"), None, None).await.unwrap_err();
        assert!(matches!(err, NodeGraphError::Llm(_)));
    }

    #[tokio::test]
    async fn test_failure_without_metadata_raises_even_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ErrorCache::new(dir.path().join("err.jsonl"));
        let backend = Arc::new(FixedBackend::new(LlmResponse::Failure("401 unauthorized".into())));
        let client = OrchestrationClient::new(backend, &config(DispatchPolicy::SingleFlight, Duration::ZERO));

        let result = client.call(&LlmRequest::text("q"), Some(&cache), None).await;
        assert!(result.is_err());
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_with_cache_and_metadata_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ErrorCache::new(dir.path().join("err.jsonl"));
        let backend = Arc::new(FixedBackend::new(LlmResponse::Failure(
            "Anthropic API returned status 429: rate limit".into(),
        )));
        let client = OrchestrationClient::new(backend, &config(DispatchPolicy::SingleFlight, Duration::ZERO));

        let request = LlmRequest::structured("decompose", ResponseSchema::TextDecomposition);
        let metadata = json!({"text_hash_id": "h1", "text_id": "doc#0"});
        let outcome = client.call(&request, Some(&cache), Some(&metadata)).await.unwrap();

        assert_eq!(outcome, CallOutcome::Cached);
        assert_eq!(client.cached_failures(), 1);
        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input.response_format, None);
        assert_eq!(entries[0].metadata, metadata);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_holds_across_concurrent_callers() {
        let delay = Duration::from_secs(2);
        let backend = Arc::new(FixedBackend::new(LlmResponse::Structured(json!({}))));
        let client = Arc::new(OrchestrationClient::new(
            backend.clone(),
            &config(DispatchPolicy::Bounded { max_in_flight: 5 }, delay),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..5 {
            let client = client.clone();
            tasks.spawn(async move {
                client
                    .call(&LlmRequest::text(format!("q{i}")), None, None)
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let mut times = backend.dispatch_times.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_never_overlaps() {
        let backend = Arc::new(
            FixedBackend::new(LlmResponse::Structured(json!({}))).holding(Duration::from_millis(50)),
        );
        let client = Arc::new(OrchestrationClient::new(
            backend.clone(),
            &config(DispatchPolicy::SingleFlight, Duration::ZERO),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let client = client.clone();
            tasks.spawn(async move { client.call(&LlmRequest::text("q"), None, None).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
        assert_eq!(client.dispatched(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_caps_in_flight() {
        let backend = Arc::new(
            FixedBackend::new(LlmResponse::Structured(json!({}))).holding(Duration::from_millis(50)),
        );
        let client = Arc::new(OrchestrationClient::new(
            backend.clone(),
            &config(DispatchPolicy::Bounded { max_in_flight: 3 }, Duration::ZERO),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..9 {
            let client = client.clone();
            tasks.spawn(async move { client.call(&LlmRequest::text("q"), None, None).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 3);
        assert!(peak > 1);
    }
}
