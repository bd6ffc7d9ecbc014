//! TOML configuration.
//!
//! Only `[db]` and `[knowledge_base]` are required; every other section
//! falls back to defaults tuned for a single-machine deployment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    pub internal_root: PathBuf,
    pub external_root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are recorded as failed instead of parsed.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_debounce_ms() -> u64 {
    750
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1200
}
fn default_overlap_chars() -> usize {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default = "default_true")]
    pub ocr_enabled: bool,
    #[serde(default = "default_ocr_command")]
    pub ocr_command: String,
    #[serde(default = "default_rasterize_command")]
    pub rasterize_command: String,
    #[serde(default = "default_ocr_languages")]
    pub ocr_languages: String,
    /// PDF pages with less extracted text than this are re-read with OCR.
    #[serde(default = "default_min_page_chars")]
    pub min_page_chars: usize,
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            ocr_enabled: true,
            ocr_command: default_ocr_command(),
            rasterize_command: default_rasterize_command(),
            ocr_languages: default_ocr_languages(),
            min_page_chars: default_min_page_chars(),
            ocr_timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ocr_command() -> String {
    "tesseract".to_string()
}
fn default_rasterize_command() -> String {
    "pdftoppm".to_string()
}
fn default_ocr_languages() -> String {
    "eng+fra".to_string()
}
fn default_min_page_chars() -> usize {
    50
}
fn default_ocr_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    8
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How often idle workers re-check the queue without a wake-up.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_lease_secs() -> u64 {
    600
}
fn default_initial_backoff_ms() -> u64 {
    10_000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_idle_poll_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Cosine similarity below which a chunk is not considered grounding.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,
    /// Hits kept after reranking; 0 keeps all of them.
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            rerank_top_k: default_rerank_top_k(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            max_context_chars: default_max_context_chars(),
            default_language: default_language(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_min_relevance() -> f32 {
    0.2
}
fn default_rerank_top_k() -> usize {
    5
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_language() -> String {
    "en".to_string()
}
fn default_query_timeout_secs() -> u64 {
    90
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
    "127.0.0.1:8001".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.knowledge_base.internal_root == config.knowledge_base.external_root {
        anyhow::bail!("knowledge_base.internal_root and external_root must differ");
    }

    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    // Validate queue
    if config.queue.workers == 0 {
        anyhow::bail!("queue.workers must be >= 1");
    }
    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_relevance) {
        anyhow::bail!("retrieval.min_relevance must be in [-1.0, 1.0]");
    }
    if config.retrieval.max_chunks_per_doc == 0 {
        anyhow::bail!("retrieval.max_chunks_per_doc must be >= 1");
    }
    match config.retrieval.default_language.as_str() {
        "en" | "fr" => {}
        other => anyhow::bail!(
            "Unknown retrieval.default_language: '{}'. Must be en or fr.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.generation.provider.as_str() {
        "extractive" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/kh.sqlite"

[knowledge_base]
internal_root = "/kb/internal"
external_root = "/kb/external"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.provider, "extractive");
        assert_eq!(config.chunking.max_chars, 1200);
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.knowledge_base.include_globs, vec!["**/*"]);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.chunking.overlap_chars = config.chunking.max_chars;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn remote_embedding_requires_model_and_dims() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.embedding.provider = "openai".to_string();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"));
    }

    #[test]
    fn unknown_language_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.retrieval.default_language = "de".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn identical_roots_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.knowledge_base.external_root = config.knowledge_base.internal_root.clone();
        assert!(validate(&config).is_err());
    }
}
