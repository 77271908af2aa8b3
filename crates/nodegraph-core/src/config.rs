use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeGraphError, Result};

const DEFAULT_RATE_LIMIT_RPM: f64 = 10.0;
const FALLBACK_DELAY_SECS: f64 = 6.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Anthropic,
}

/// How many LLM calls may be in flight at once. Pacing applies in both modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// One call at a time.
    SingleFlight,
    /// Up to `max_in_flight` concurrent calls.
    Bounded { max_in_flight: usize },
}

impl DispatchPolicy {
    pub fn max_in_flight(&self) -> usize {
        match self {
            DispatchPolicy::SingleFlight => 1,
            DispatchPolicy::Bounded { max_in_flight } => (*max_in_flight).max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub dispatch: DispatchPolicy,
    pub request_delay: Duration,
}

impl OrchestrationConfig {
    /// Delay between dispatches: the explicit delay wins, else `60 / rpm`.
    /// Values that do not fit a `Duration` (infinite, or an rpm so small the
    /// delay overflows) are a configuration error.
    pub fn delay_from(request_delay_secs: Option<f64>, rate_limit_rpm: Option<f64>) -> Result<Duration> {
        let secs = match request_delay_secs {
            Some(d) if d >= 0.0 => d,
            _ => {
                let rpm = rate_limit_rpm.unwrap_or(DEFAULT_RATE_LIMIT_RPM);
                if rpm > 0.0 {
                    60.0 / rpm
                } else {
                    FALLBACK_DELAY_SECS
                }
            }
        };
        Duration::try_from_secs_f64(secs)
            .map_err(|e| NodeGraphError::Config(format!("invalid request delay of {secs} s: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub embedding_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    /// Personalized PageRank computed in-process over the fetched subgraph.
    Local,
    /// Ask the graph store for its own neighbor scores.
    StoreNative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub entity_cap: usize,
    pub relationship_cap: usize,
    pub high_level_cap: usize,
    pub cross_cap: usize,
    pub damping: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub max_hops: u32,
    pub similarity_weight: f64,
    pub accuracy_weight: f64,
    pub qa_threshold: f32,
    pub ranking: RankingMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            entity_cap: 10,
            relationship_cap: 30,
            high_level_cap: 10,
            cross_cap: 10,
            damping: 0.5,
            max_iterations: 2,
            tolerance: 1e-6,
            max_hops: 2,
            similarity_weight: 1.0,
            accuracy_weight: 10.0,
            qa_threshold: 0.8,
            ranking: RankingMode::Local,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub enabled: bool,
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Upper bound on a single mirror statement.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cache_dir: PathBuf,
    pub llm: LlmConfig,
    pub orchestration: OrchestrationConfig,
    pub retrieval: RetrievalConfig,
    pub neo4j: Neo4jConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let dispatch = match env_or("NODEGRAPH_DISPATCH", "single_flight").as_str() {
            "bounded" => DispatchPolicy::Bounded {
                max_in_flight: env_parse("NODEGRAPH_MAX_CONCURRENT").unwrap_or(4),
            },
            _ => DispatchPolicy::SingleFlight,
        };

        let defaults = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            top_k: env_parse("NODEGRAPH_TOP_K").unwrap_or(defaults.top_k),
            entity_cap: env_parse("NODEGRAPH_ENODE").unwrap_or(defaults.entity_cap),
            relationship_cap: env_parse("NODEGRAPH_RNODE").unwrap_or(defaults.relationship_cap),
            high_level_cap: env_parse("NODEGRAPH_HNODE").unwrap_or(defaults.high_level_cap),
            cross_cap: env_parse("NODEGRAPH_CROSS_NODE").unwrap_or(defaults.cross_cap),
            damping: env_parse("NODEGRAPH_PPR_ALPHA").unwrap_or(defaults.damping),
            max_iterations: env_parse("NODEGRAPH_PPR_MAX_ITER").unwrap_or(defaults.max_iterations),
            tolerance: defaults.tolerance,
            max_hops: env_parse("NODEGRAPH_MAX_HOPS").unwrap_or(defaults.max_hops),
            similarity_weight: env_parse("NODEGRAPH_SIMILARITY_WEIGHT")
                .unwrap_or(defaults.similarity_weight),
            accuracy_weight: env_parse("NODEGRAPH_ACCURACY_WEIGHT")
                .unwrap_or(defaults.accuracy_weight),
            qa_threshold: env_parse("NODEGRAPH_QA_THRESHOLD").unwrap_or(defaults.qa_threshold),
            ranking: match env_or("NODEGRAPH_RANKING", "local").as_str() {
                "store_native" => RankingMode::StoreNative,
                _ => RankingMode::Local,
            },
        };

        Ok(Self {
            cache_dir: PathBuf::from(env_or("NODEGRAPH_CACHE_DIR", "./cache")),
            llm: LlmConfig {
                provider: LlmProvider::Anthropic,
                api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                model: env_or("NODEGRAPH_MODEL", "claude-haiku-4-5-20251001"),
                max_tokens: env_parse("NODEGRAPH_MAX_TOKENS").unwrap_or(4096),
                embedding_url: env_or("NODEGRAPH_EMBEDDING_URL", "https://api.openai.com/v1"),
                embedding_api_key: std::env::var("NODEGRAPH_EMBEDDING_API_KEY")
                    .or_else(|_| std::env::var("OPENAI_API_KEY"))
                    .unwrap_or_default(),
                embedding_model: env_or("NODEGRAPH_EMBEDDING_MODEL", "text-embedding-3-small"),
            },
            orchestration: OrchestrationConfig {
                dispatch,
                request_delay: OrchestrationConfig::delay_from(
                    env_parse("NODEGRAPH_REQUEST_DELAY_SECS"),
                    env_parse("NODEGRAPH_RATE_LIMIT_RPM"),
                )?,
            },
            retrieval,
            neo4j: Neo4jConfig {
                enabled: env_parse("NODEGRAPH_USE_NEO4J").unwrap_or(false),
                uri: env_or("NEO4J_URI", "bolt://localhost:7687"),
                user: env_or("NEO4J_USER", "neo4j"),
                password: env_or("NEO4J_PASSWORD", "nodegraph"),
                timeout_secs: env_parse::<u64>("NODEGRAPH_NEO4J_TIMEOUT_SECS").unwrap_or(5).max(1),
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.llm.embedding_url).map_err(|e| {
            NodeGraphError::Config(format!(
                "invalid embedding url {}: {e}",
                self.llm.embedding_url
            ))
        })?;
        if self.neo4j.enabled {
            url::Url::parse(&self.neo4j.uri).map_err(|e| {
                NodeGraphError::Config(format!("invalid Neo4j uri {}: {e}", self.neo4j.uri))
            })?;
        }
        let r = &self.retrieval;
        if !(0.0..1.0).contains(&r.damping) {
            return Err(NodeGraphError::Config(format!(
                "damping must be in [0, 1), got {}",
                r.damping
            )));
        }
        if r.max_iterations == 0 {
            return Err(NodeGraphError::Config("max_iterations must be at least 1".into()));
        }
        if r.top_k == 0 {
            return Err(NodeGraphError::Config("top_k must be at least 1".into()));
        }
        Ok(())
    }

    pub fn text_units_path(&self) -> PathBuf {
        self.cache_dir.join("text_units.jsonl")
    }

    pub fn decomposition_log_path(&self) -> PathBuf {
        self.cache_dir.join("text_decomposition.jsonl")
    }

    pub fn error_cache_path(&self) -> PathBuf {
        self.cache_dir.join("llm_error.jsonl")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.cache_dir.join("graph.json")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.cache_dir.join("records")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.cache_dir.join("entity_index.json")
    }

    pub fn qa_index_path(&self) -> PathBuf {
        self.cache_dir.join("qa_index.json")
    }
}
