use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use transcript_retrieval_core::chunk::{ChunkUnit, ChunkingConfig as CoreChunking};
use transcript_retrieval_core::retrieve::{RetrievalConfig as CoreRetrieval, RetrievalWeights};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_unit")]
    pub unit: ChunkUnit,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            max_len: default_max_len(),
            overlap: default_overlap(),
        }
    }
}

fn default_unit() -> ChunkUnit {
    ChunkUnit::Sentences
}
fn default_max_len() -> usize {
    8
}
fn default_overlap() -> usize {
    1
}

impl ChunkingConfig {
    pub fn to_core(&self) -> Result<CoreChunking> {
        let core = CoreChunking {
            unit: self.unit,
            max_len: self.max_len,
            overlap: self.overlap,
        };
        core.validate()?;
        Ok(core)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_stale_after_secs() -> u64 {
    900
}
fn default_interval_secs() -> u64 {
    60
}

impl WatchdogConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight_vector")]
    pub weight_vector: f64,
    #[serde(default = "default_weight_fts")]
    pub weight_fts: f64,
    #[serde(default = "default_weight_entity")]
    pub weight_entity: f64,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    #[serde(default = "default_entity_saturation")]
    pub entity_saturation: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weight_vector: default_weight_vector(),
            weight_fts: default_weight_fts(),
            weight_entity: default_weight_entity(),
            match_count: default_match_count(),
            entity_saturation: default_entity_saturation(),
        }
    }
}

fn default_weight_vector() -> f64 {
    0.6
}
fn default_weight_fts() -> f64 {
    0.3
}
fn default_weight_entity() -> f64 {
    0.1
}
fn default_match_count() -> usize {
    8
}
fn default_entity_saturation() -> u32 {
    3
}

impl RetrievalConfig {
    pub fn weights(&self) -> RetrievalWeights {
        RetrievalWeights::new(self.weight_vector, self.weight_fts, self.weight_entity)
    }

    pub fn to_core(&self) -> CoreRetrieval {
        CoreRetrieval {
            weights: self.weights(),
            match_count: self.match_count,
            entity_saturation: self.entity_saturation,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub competitors: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extraction_provider(),
            url: None,
            timeout_secs: default_timeout_secs(),
            competitors: Vec::new(),
            products: Vec::new(),
        }
    }
}

fn default_extraction_provider() -> String {
    "keyword".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    config
        .chunking
        .to_core()
        .with_context(|| "Invalid [chunking] section")?;

    // Validate indexing
    if config.indexing.workers == 0 {
        anyhow::bail!("indexing.workers must be >= 1");
    }
    if config.indexing.max_attempts == 0 {
        anyhow::bail!("indexing.max_attempts must be >= 1");
    }

    // Validate watchdog
    if config.watchdog.stale_after_secs == 0 || config.watchdog.interval_secs == 0 {
        anyhow::bail!("watchdog.stale_after_secs and watchdog.interval_secs must be > 0");
    }
    let worst_case = u64::from(config.indexing.max_attempts)
        * (config.embedding.timeout_secs + config.extraction.timeout_secs);
    if config.watchdog.stale_after_secs <= worst_case {
        tracing::warn!(
            stale_after_secs = config.watchdog.stale_after_secs,
            worst_case_secs = worst_case,
            "watchdog.stale_after_secs is not larger than the slowest expected chunk; healthy claims may be reclaimed"
        );
    }

    // Validate retrieval
    config
        .retrieval
        .weights()
        .validate()
        .map_err(|e| anyhow::anyhow!("retrieval: {}", e))?;
    if config.retrieval.match_count < 1 {
        anyhow::bail!("retrieval.match_count must be >= 1");
    }
    if config.retrieval.entity_saturation < 1 {
        anyhow::bail!("retrieval.entity_saturation must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.unwrap_or(0) == 0 {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        "hashing" => {
            if config.embedding.dims.unwrap_or(0) == 0 {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'hashing'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hashing.",
            other
        ),
    }

    // Validate extraction
    match config.extraction.provider.as_str() {
        "keyword" => {}
        "http" => {
            if config.extraction.url.is_none() {
                anyhow::bail!("extraction.url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be keyword or http.",
            other
        ),
    }

    Ok(())
}
