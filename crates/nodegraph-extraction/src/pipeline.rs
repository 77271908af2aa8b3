use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use nodegraph_core::config::AppConfig;
use nodegraph_core::entity::TextUnit;
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::llm::{parse_json_reply, LlmRequest, ResponseSchema};
use nodegraph_core::records::{append_jsonl, read_jsonl, TextUnitRecord};
use nodegraph_llm::{CallOutcome, ErrorCache, ErrorCacheEntry, OrchestrationClient};

use crate::decomposition::Decomposition;
use crate::prompts;

/// Failures listed individually in the fatal report.
const REPORT_SAMPLE: usize = 5;

/// One line of the text units file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceText {
    pub text_id: String,
    pub raw_text: String,
}

/// Metadata attached to a decomposition call, kept with cached failures so
/// the call can be replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecompositionMeta {
    text_hash_id: String,
    text_id: String,
    raw_text: String,
}

impl From<&TextUnit> for DecompositionMeta {
    fn from(unit: &TextUnit) -> Self {
        Self {
            text_hash_id: unit.hash_id.clone(),
            text_id: unit.text_id.clone(),
            raw_text: unit.raw_text.clone(),
        }
    }
}

impl DecompositionMeta {
    fn text_unit(&self) -> TextUnit {
        TextUnit {
            hash_id: self.text_hash_id.clone(),
            text_id: self.text_id.clone(),
            raw_text: self.raw_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Decomposed,
    Cached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecompositionReport {
    /// Text units known to the stage.
    pub total: usize,
    /// Units already present in the decomposition log.
    pub skipped: usize,
    pub decomposed: usize,
    /// Units whose call failed and was written to the failure cache.
    pub cached: usize,
    /// Units whose call raised; they stay pending for the next run.
    pub failed: usize,
    /// Cached failures replayed before the normal pass.
    pub replayed: usize,
}

/// Maps text units to semantic units, entities and relationship strings.
#[derive(Clone)]
pub struct TextDecomposer {
    client: Arc<OrchestrationClient>,
    error_cache: Arc<ErrorCache>,
    text_units_path: PathBuf,
    log_path: PathBuf,
    log_lock: Arc<Mutex<()>>,
}

impl TextDecomposer {
    pub fn new(client: Arc<OrchestrationClient>, config: &AppConfig) -> Self {
        Self {
            client,
            error_cache: Arc::new(ErrorCache::new(config.error_cache_path())),
            text_units_path: config.text_units_path(),
            log_path: config.decomposition_log_path(),
            log_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn error_cache(&self) -> &ErrorCache {
        &self.error_cache
    }

    /// All text units, deduplicated by hash id in file order.
    pub async fn load_text_units(&self) -> Result<Vec<TextUnit>> {
        let sources: Vec<SourceText> = read_jsonl(&self.text_units_path).await?;
        let mut seen = HashSet::new();
        Ok(sources
            .into_iter()
            .map(|s| TextUnit::new(s.text_id, s.raw_text))
            .filter(|unit| seen.insert(unit.hash_id.clone()))
            .collect())
    }

    pub async fn load_log(&self) -> Result<Vec<TextUnitRecord>> {
        read_jsonl(&self.log_path).await
    }

    /// Decompose pending units, then fail if any failure is left cached.
    pub async fn run(&self) -> Result<DecompositionReport> {
        let report = self.decompose_pending().await?;
        self.check_error_cache().await?;
        Ok(report)
    }

    /// Replay the failure cache, continue with pending units, then fail if
    /// any failure is left cached. Each text unit is dispatched at most once
    /// per rerun: cached duplicates collapse to one replay, units already in
    /// the log are not replayed, and replayed units are left out of the
    /// pending pass even when the replay failed again.
    pub async fn rerun(&self) -> Result<DecompositionReport> {
        let entries = self.error_cache.entries().await?;
        self.error_cache.truncate().await?;
        tracing::info!(count = entries.len(), "Replaying cached decomposition failures");

        let logged = self.logged_hashes().await?;
        let mut replayed: HashSet<String> = HashSet::new();
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let meta = match serde_json::from_value::<DecompositionMeta>(entry.metadata.clone()) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(error = %e, "Cached failure has unusable metadata, keeping it");
                    self.error_cache.append(&entry).await?;
                    continue;
                }
            };
            if logged.contains(&meta.text_hash_id) {
                tracing::debug!(text_id = %meta.text_id, "Cached failure already decomposed, dropping it");
                continue;
            }
            if !replayed.insert(meta.text_hash_id.clone()) {
                continue;
            }
            let request = if entry.input.query.is_empty() {
                decomposition_request(&meta.raw_text)
            } else {
                LlmRequest::structured(entry.input.query, ResponseSchema::TextDecomposition)
            };
            jobs.push((meta.text_unit(), request));
        }

        let replay = self.decompose_all(jobs).await?;
        let mut report = self.decompose_pending_except(&replayed).await?;
        report.replayed = replay.decomposed + replay.cached + replay.failed;
        report.decomposed += replay.decomposed;
        report.cached += replay.cached;
        report.failed += replay.failed;

        self.check_error_cache().await?;
        Ok(report)
    }

    /// Decompose every unit with no line in the decomposition log yet.
    pub async fn decompose_pending(&self) -> Result<DecompositionReport> {
        self.decompose_pending_except(&HashSet::new()).await
    }

    async fn decompose_pending_except(&self, exclude: &HashSet<String>) -> Result<DecompositionReport> {
        let units = self.load_text_units().await?;
        let total = units.len();
        let logged = self.logged_hashes().await?;

        let pending: Vec<(TextUnit, LlmRequest)> = units
            .into_iter()
            .filter(|unit| !logged.contains(&unit.hash_id) && !exclude.contains(&unit.hash_id))
            .map(|unit| {
                let request = decomposition_request(&unit.raw_text);
                (unit, request)
            })
            .collect();

        if pending.is_empty() {
            tracing::info!(total, "No texts to process, all already decomposed");
        }

        let mut report = self.decompose_all(pending).await?;
        report.total = total;
        report.skipped = total.saturating_sub(report.decomposed + report.cached + report.failed);
        Ok(report)
    }

    async fn logged_hashes(&self) -> Result<HashSet<String>> {
        Ok(self
            .load_log()
            .await?
            .into_iter()
            .map(|record| record.text_hash_id)
            .collect())
    }

    async fn decompose_all(&self, jobs: Vec<(TextUnit, LlmRequest)>) -> Result<DecompositionReport> {
        let total = jobs.len();
        let mut report = DecompositionReport::default();
        if total == 0 {
            return Ok(report);
        }
        tracing::info!(count = total, "Starting text decomposition");

        let mut join_set = JoinSet::new();
        for (unit, request) in jobs {
            let stage = self.clone();
            join_set.spawn(async move {
                let outcome = stage.decompose_one(&unit, &request).await;
                (unit, outcome)
            });
        }

        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            completed += 1;
            match joined {
                Ok((_, Ok(UnitOutcome::Decomposed))) => report.decomposed += 1,
                Ok((_, Ok(UnitOutcome::Cached))) => report.cached += 1,
                Ok((unit, Err(e))) => {
                    tracing::error!(text_id = %unit.text_id, error = %e, "Text decomposition failed");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Decomposition task panicked");
                    report.failed += 1;
                }
            }
            tracing::info!(completed, total, "Text decomposition progress");
        }

        tracing::info!(
            decomposed = report.decomposed,
            cached = report.cached,
            failed = report.failed,
            "Text decomposition finished"
        );
        Ok(report)
    }

    async fn decompose_one(&self, unit: &TextUnit, request: &LlmRequest) -> Result<UnitOutcome> {
        let metadata = serde_json::to_value(DecompositionMeta::from(unit))?;

        let outcome = self
            .client
            .call(request, Some(&self.error_cache), Some(&metadata))
            .await?;

        let response = match outcome {
            CallOutcome::Cached => return Ok(UnitOutcome::Cached),
            CallOutcome::Structured(value) => {
                Decomposition::from_value(&value).is_some().then_some(value)
            }
            CallOutcome::Raw(text) => parse_json_reply(&text)
                .filter(|value| Decomposition::from_value(value).is_some()),
        };

        let Some(response) = response else {
            tracing::warn!(text_id = %unit.text_id, "Unusable decomposition reply, caching for replay");
            self.error_cache
                .append(&ErrorCacheEntry::new(request, metadata))
                .await?;
            return Ok(UnitOutcome::Cached);
        };

        let record = TextUnitRecord::decomposed(unit, response);
        let _guard = self.log_lock.lock().await;
        append_jsonl(&self.log_path, std::slice::from_ref(&record)).await?;
        tracing::debug!(text_id = %unit.text_id, "Text unit decomposed");
        Ok(UnitOutcome::Decomposed)
    }

    /// Fail with [`NodeGraphError::UnresolvedFailures`] if the failure cache
    /// is non-empty, logging a short sample of the affected texts.
    pub async fn check_error_cache(&self) -> Result<()> {
        let entries = self.error_cache.entries().await?;
        if entries.is_empty() {
            return Ok(());
        }

        tracing::error!(count = entries.len(), "LLM errors detected in text decomposition");
        for line in failure_sample(&entries) {
            tracing::error!("{line}");
        }
        tracing::error!(
            path = %self.error_cache.path().display(),
            "Fix the cause and rerun the pipeline to replay the failure cache"
        );
        Err(NodeGraphError::UnresolvedFailures {
            count: entries.len(),
        })
    }
}

fn decomposition_request(raw_text: &str) -> LlmRequest {
    LlmRequest::structured(
        prompts::text_decomposition(raw_text),
        ResponseSchema::TextDecomposition,
    )
}

fn failure_sample(entries: &[ErrorCacheEntry]) -> Vec<String> {
    let mut lines: Vec<String> = entries
        .iter()
        .take(REPORT_SAMPLE)
        .map(|entry| {
            let text_id = entry.metadata["text_id"].as_str().unwrap_or("unknown");
            let hash: String = entry.metadata["text_hash_id"]
                .as_str()
                .map(|h| h.chars().take(8).collect())
                .unwrap_or_else(|| "unknown".to_string());
            format!("  - Text ID: {text_id}, Hash: {hash}")
        })
        .collect();
    if entries.len() > REPORT_SAMPLE {
        lines.push(format!("  ... and {} more", entries.len() - REPORT_SAMPLE));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nodegraph_core::config::{DispatchPolicy, OrchestrationConfig};
    use nodegraph_core::llm::{LlmBackend, LlmResponse};
    use serde_json::json;
    use std::time::Duration;

    /// Answers by substring of the prompt; anything unmatched gets `fallback`.
    struct KeywordBackend {
        rules: Vec<(&'static str, LlmResponse)>,
        fallback: LlmResponse,
    }

    #[async_trait]
    impl LlmBackend for KeywordBackend {
        fn name(&self) -> &str {
            "keyword"
        }

        async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
            Ok(self
                .rules
                .iter()
                .find(|(needle, _)| request.query.contains(needle))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| self.fallback.clone()))
        }
    }

    fn app_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::from_env().unwrap();
        config.cache_dir = dir.to_path_buf();
        config
    }

    /// Keeps every prompt it forwards.
    struct Recorder {
        inner: KeywordBackend,
        queries: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmBackend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
            self.queries.lock().unwrap().push(request.query.clone());
            self.inner.generate(request).await
        }
    }

    fn recorder(inner: KeywordBackend) -> Arc<Recorder> {
        Arc::new(Recorder {
            inner,
            queries: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn stage(dir: &std::path::Path, backend: KeywordBackend) -> TextDecomposer {
        stage_with(dir, Arc::new(backend))
    }

    fn stage_with(dir: &std::path::Path, backend: Arc<dyn LlmBackend>) -> TextDecomposer {
        let client = OrchestrationClient::new(
            backend,
            &OrchestrationConfig {
                dispatch: DispatchPolicy::Bounded { max_in_flight: 4 },
                request_delay: Duration::ZERO,
            },
        );
        TextDecomposer::new(Arc::new(client), &app_config(dir))
    }

    async fn write_sources(dir: &std::path::Path, texts: &[(&str, &str)]) {
        let sources: Vec<SourceText> = texts
            .iter()
            .map(|(id, text)| SourceText {
                text_id: id.to_string(),
                raw_text: text.to_string(),
            })
            .collect();
        nodegraph_core::records::write_jsonl(&app_config(dir).text_units_path(), &sources)
            .await
            .unwrap();
    }

    fn good_reply() -> LlmResponse {
        LlmResponse::Structured(json!({"Output": [{
            "semantic_unit": "Alice manages Bob",
            "entities": ["ALICE", "BOB"],
            "relationships": ["ALICE, manages, BOB"]
        }]}))
    }

    #[tokio::test]
    async fn test_decomposes_pending_and_skips_logged_units() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("doc#0", "Alice manages Bob at Acme")]).await;
        let decomposer = stage(
            dir.path(),
            KeywordBackend {
                rules: vec![],
                fallback: good_reply(),
            },
        );

        let first = decomposer.run().await.unwrap();
        assert_eq!(first.decomposed, 1);
        let log = decomposer.load_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(!log[0].processed);
        assert_eq!(log[0].text_id, "doc#0");

        let second = decomposer.run().await.unwrap();
        assert_eq!(second.decomposed, 0);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn test_failures_are_cached_and_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(
            dir.path(),
            &[("ok", "Alice manages Bob"), ("bad", "Carol sues Dave")],
        )
        .await;
        let decomposer = stage(
            dir.path(),
            KeywordBackend {
                rules: vec![("Carol", LlmResponse::Failure("429 rate limit".into()))],
                fallback: good_reply(),
            },
        );

        let err = decomposer.run().await.unwrap_err();
        assert!(matches!(err, NodeGraphError::UnresolvedFailures { count: 1 }));
        assert_eq!(decomposer.load_log().await.unwrap().len(), 1);

        let cached = decomposer.error_cache().entries().await.unwrap();
        assert_eq!(cached[0].metadata["text_id"], "bad");
        assert!(cached[0].input.response_format.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_reply_is_cached_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("doc", "Alice manages Bob")]).await;
        let prose = "Sure! The text describes a manager and a direct report working together at a company called Acme, in some detail.";
        let decomposer = stage(
            dir.path(),
            KeywordBackend {
                rules: vec![],
                fallback: LlmResponse::Raw(prose.into()),
            },
        );

        let report = decomposer.decompose_pending().await.unwrap();
        assert_eq!(report.cached, 1);
        assert_eq!(decomposer.error_cache().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rerun_replays_and_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("doc", "Alice manages Bob")]).await;

        let failing = stage(
            dir.path(),
            KeywordBackend {
                rules: vec![],
                fallback: LlmResponse::Failure("401 unauthorized".into()),
            },
        );
        assert!(failing.run().await.is_err());

        write_sources(
            dir.path(),
            &[("doc", "Alice manages Bob"), ("new", "Erin joins Acme")],
        )
        .await;
        let healthy = stage(
            dir.path(),
            KeywordBackend {
                rules: vec![],
                fallback: good_reply(),
            },
        );
        let report = healthy.rerun().await.unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(report.decomposed, 2);
        assert_eq!(healthy.error_cache().count().await.unwrap(), 0);
        assert_eq!(healthy.load_log().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_that_fails_again_dispatches_each_unit_once() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("doc", "Alice manages Bob")]).await;
        let failing = || KeywordBackend {
            rules: vec![],
            fallback: LlmResponse::Failure("503 upstream failed".into()),
        };
        assert!(stage(dir.path(), failing()).run().await.is_err());

        let backend = recorder(failing());
        let decomposer = stage_with(dir.path(), backend.clone());
        let err = decomposer.rerun().await.unwrap_err();

        assert!(matches!(err, NodeGraphError::UnresolvedFailures { count: 1 }));
        assert_eq!(backend.queries.lock().unwrap().len(), 1);
        assert_eq!(decomposer.error_cache().count().await.unwrap(), 1);
        assert!(decomposer.load_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_collapses_duplicate_entries_and_skips_logged_units() {
        let dir = tempfile::tempdir().unwrap();
        let healthy = || KeywordBackend {
            rules: vec![],
            fallback: good_reply(),
        };
        write_sources(dir.path(), &[("done", "Erin joins Acme")]).await;
        stage(dir.path(), healthy()).decompose_pending().await.unwrap();
        write_sources(
            dir.path(),
            &[("done", "Erin joins Acme"), ("doc", "Alice manages Bob")],
        )
        .await;

        // Two stale entries for one unit and one for a unit already logged.
        let cache = ErrorCache::new(app_config(dir.path()).error_cache_path());
        let logged = TextUnit::new("done", "Erin joins Acme");
        let pending = TextUnit::new("doc", "Alice manages Bob");
        for unit in [&pending, &pending, &logged] {
            let meta = serde_json::to_value(DecompositionMeta::from(unit)).unwrap();
            cache
                .append(&ErrorCacheEntry::new(&decomposition_request(&unit.raw_text), meta))
                .await
                .unwrap();
        }

        let backend = recorder(healthy());
        let decomposer = stage_with(dir.path(), backend.clone());
        let report = decomposer.rerun().await.unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(backend.queries.lock().unwrap().len(), 1);
        let log = decomposer.load_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().filter(|r| r.text_hash_id == pending.hash_id).count(), 1);
    }

    #[tokio::test]
    async fn test_rerun_replays_the_cached_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("doc", "Alice manages Bob")]).await;
        let unit = TextUnit::new("doc", "Alice manages Bob");
        let meta = serde_json::to_value(DecompositionMeta::from(&unit)).unwrap();
        ErrorCache::new(app_config(dir.path()).error_cache_path())
            .append(&ErrorCacheEntry::new(&LlmRequest::text("older prompt: Alice manages Bob"), meta))
            .await
            .unwrap();

        let backend = recorder(KeywordBackend {
            rules: vec![],
            fallback: good_reply(),
        });
        let report = stage_with(dir.path(), backend.clone()).rerun().await.unwrap();

        assert_eq!(report.replayed, 1);
        let queries = backend.queries.lock().unwrap();
        assert_eq!(queries.as_slice(), ["older prompt: Alice manages Bob"]);
    }

    #[test]
    fn test_failure_sample_truncates() {
        let entries: Vec<ErrorCacheEntry> = (0..7)
            .map(|i| {
                ErrorCacheEntry::new(
                    &LlmRequest::text("q"),
                    json!({"text_id": format!("t{i}"), "text_hash_id": "abcdef0123456789"}),
                )
            })
            .collect();
        let lines = failure_sample(&entries);
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "  - Text ID: t0, Hash: abcdef01");
        assert_eq!(lines[5], "  ... and 2 more");
    }
}
