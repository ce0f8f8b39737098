use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `items.json` and `index.json`; in-memory only when unset
    pub data_dir: Option<PathBuf>,
    /// Write a snapshot after this many writes (0 = only on maintenance)
    pub snapshot_every_n_writes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            snapshot_every_n_writes: 50,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CorpusConfig {
    /// Fixed at corpus creation
    pub embedding_dimension: usize,
    pub max_content_length: usize,
    pub max_tags: usize,
    /// Maximum number of records, tombstones included
    pub hard_size_cap: usize,
    /// Index size above which queries skip the archived tier
    pub index_size_ceiling: usize,
    pub embedding_timeout_ms: u64,
}

impl CorpusConfig {
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 256,
            max_content_length: 10_000,
            max_tags: 16,
            hard_size_cap: 10_000,
            index_size_ceiling: 5_000,
            embedding_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RankingWeights {
    pub w_sim: f64,
    pub w_recency: f64,
    pub w_type: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            w_sim: 0.6,
            w_recency: 0.2,
            w_type: 0.2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched per requested item
    pub k_candidates_multiplier: usize,
    pub dedup_similarity_threshold: f64,
    /// Floor on raw cosine similarity
    pub min_similarity: f64,
    pub default_budget: usize,
    pub max_budget: usize,
    pub max_query_length: usize,
    pub retrieval_timeout_ms: u64,
    pub recency_half_life_hours: f64,
    pub ranking_weights: RankingWeights,
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_candidates_multiplier: 4,
            dedup_similarity_threshold: 0.95,
            min_similarity: 0.1,
            default_budget: 10,
            max_budget: 50,
            max_query_length: 500,
            retrieval_timeout_ms: 1_000,
            recency_half_life_hours: 24.0,
            ranking_weights: RankingWeights::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    /// T1
    pub stale_after_secs: u64,
    /// T2
    pub archive_after_secs: u64,
    /// T3
    pub purge_after_secs: u64,
    /// D1
    pub stale_iteration_distance: u64,
    /// Items retrieved at least this often are not staled by iteration distance
    pub stale_min_retrievals: u64,
    /// Run a sweep after this many writes (0 = explicit maintenance only)
    pub sweep_every_n_writes: u64,
}

impl LifecycleConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        secs(self.stale_after_secs)
    }

    pub fn archive_after(&self) -> chrono::Duration {
        secs(self.archive_after_secs)
    }

    pub fn purge_after(&self) -> chrono::Duration {
        secs(self.purge_after_secs)
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 6 * 3600,
            archive_after_secs: 24 * 3600,
            purge_after_secs: 7 * 24 * 3600,
            stale_iteration_distance: 10,
            stale_min_retrievals: 1,
            sweep_every_n_writes: 25,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("logging.json", false)?
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CONTEXT_API").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let corpus = &self.corpus;
        if corpus.embedding_dimension == 0 {
            return Err(invalid("corpus.embedding_dimension must be positive"));
        }
        if corpus.hard_size_cap == 0 {
            return Err(invalid("corpus.hard_size_cap must be positive"));
        }
        if corpus.max_content_length == 0 {
            return Err(invalid("corpus.max_content_length must be positive"));
        }

        let retrieval = &self.retrieval;
        if retrieval.k_candidates_multiplier < 1 {
            return Err(invalid("retrieval.k_candidates_multiplier must be at least 1"));
        }
        if !(0.0..=1.0).contains(&retrieval.dedup_similarity_threshold) {
            return Err(invalid(
                "retrieval.dedup_similarity_threshold must be within [0, 1]",
            ));
        }
        if !(-1.0..=1.0).contains(&retrieval.min_similarity) {
            return Err(invalid("retrieval.min_similarity must be within [-1, 1]"));
        }
        if retrieval.max_budget == 0 || retrieval.default_budget == 0 {
            return Err(invalid("retrieval budgets must be positive"));
        }
        if retrieval.default_budget > retrieval.max_budget {
            return Err(invalid(
                "retrieval.default_budget must not exceed retrieval.max_budget",
            ));
        }
        if retrieval.recency_half_life_hours <= 0.0 || !retrieval.recency_half_life_hours.is_finite()
        {
            return Err(invalid("retrieval.recency_half_life_hours must be positive"));
        }
        let w = retrieval.ranking_weights;
        if [w.w_sim, w.w_recency, w.w_type]
            .iter()
            .any(|v| *v < 0.0 || !v.is_finite())
        {
            return Err(invalid("retrieval.ranking_weights must be non-negative"));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.stale_after_secs > lifecycle.archive_after_secs
            || lifecycle.archive_after_secs > lifecycle.purge_after_secs
        {
            return Err(invalid(
                "lifecycle thresholds must satisfy stale_after <= archive_after <= purge_after",
            ));
        }
        if lifecycle.stale_iteration_distance == 0 {
            return Err(invalid("lifecycle.stale_iteration_distance must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Message(message.to_string())
}
