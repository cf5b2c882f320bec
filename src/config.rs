use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_embedding_dims(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "cohere".to_string()
}
fn default_embedding_model() -> String {
    "embed-english-v3.0".to_string()
}
fn default_embedding_dims() -> usize {
    1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_chat_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Synthesis calls are long-running; the budget is minutes, not seconds.
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_chat_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

fn default_chat_model() -> String {
    "command-r-plus".to_string()
}
fn default_chat_temperature() -> f32 {
    0.2
}
fn default_chat_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Number of most-recent keys retained by the in-process fallback when
    /// the cache service is unreachable.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_cache_host(),
            port: default_cache_port(),
            ttl_secs: default_cache_ttl_secs(),
            local_capacity: default_local_capacity(),
        }
    }
}

fn default_cache_host() -> String {
    "localhost".to_string()
}
fn default_cache_port() -> u16 {
    6379
}
fn default_cache_ttl_secs() -> u64 {
    86_400
}
fn default_local_capacity() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"s3"` for the durable object store, `"memory"` for tests and
    /// ephemeral local runs.
    #[serde(default = "default_store_provider")]
    pub provider: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    #[serde(default = "default_store_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
            bucket: String::new(),
            prefix: default_store_prefix(),
            region: default_store_region(),
            endpoint_url: None,
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

fn default_store_provider() -> String {
    "s3".to_string()
}
fn default_store_prefix() -> String {
    "vector_db/".to_string()
}
fn default_store_region() -> String {
    "us-east-1".to_string()
}
fn default_sync_interval_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    /// `"serpapi"` or `"disabled"`.
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Depth limit for `follow_links` crawling.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Optional file with one authorized domain per line; the built-in
    /// legal-source list is used when unset.
    #[serde(default)]
    pub authorized_domains_path: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            max_results: default_max_results(),
            max_depth: default_max_depth(),
            authorized_domains_path: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_search_provider() -> String {
    "serpapi".to_string()
}
fn default_max_results() -> usize {
    5
}
fn default_max_depth() -> usize {
    2
}
fn default_fetch_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_min_word_count")]
    pub min_word_count: usize,
    /// Normalized text is truncated to this many characters before
    /// embedding.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_word_count: default_min_word_count(),
            max_chars: default_max_chars(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_min_word_count() -> usize {
    50
}
fn default_max_chars() -> usize {
    8_000
}
fn default_batch_size() -> usize {
    10
}
fn default_max_workers() -> usize {
    4
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.txt".to_string(),
        "**/*.html".to_string(),
        "**/*.json".to_string(),
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Below this many vector hits, coverage is considered thin and web
    /// search is consulted (when enabled for the request).
    #[serde(default = "default_min_hits")]
    pub min_hits_before_web: usize,
    /// Bound on prioritized documents handed to synthesis.
    #[serde(default = "default_max_context_docs")]
    pub max_context_docs: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_hits_before_web: default_min_hits(),
            max_context_docs: default_max_context_docs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_hits() -> usize {
    3
}
fn default_max_context_docs() -> usize {
    8
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
    "127.0.0.1:7410".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "cohere" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be cohere or openai.",
            other
        ),
    }

    // Validate store
    match config.store.provider.as_str() {
        "s3" => {
            if config.store.bucket.is_empty() {
                anyhow::bail!("store.bucket must be set when store.provider is 's3'");
            }
        }
        "memory" => {}
        other => anyhow::bail!("Unknown store provider: '{}'. Must be s3 or memory.", other),
    }
    if config.store.sync_interval_secs == 0 {
        anyhow::bail!("store.sync_interval_secs must be > 0");
    }

    // Validate web search
    match config.web_search.provider.as_str() {
        "serpapi" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown web search provider: '{}'. Must be serpapi or disabled.",
            other
        ),
    }
    if config.web_search.max_depth == 0 {
        anyhow::bail!("web_search.max_depth must be >= 1");
    }

    // Validate retrieval and pipeline bounds
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_docs == 0 {
        anyhow::bail!("retrieval.max_context_docs must be >= 1");
    }
    if config.pipeline.max_workers == 0 {
        anyhow::bail!("pipeline.max_workers must be >= 1");
    }
    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.embedding.provider, "cohere");
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.store.sync_interval_secs, 600);
        assert_eq!(config.store.prefix, "vector_db/");
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn rejects_zero_depth() {
        let dir = std::env::temp_dir().join("lexrag-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(
            &path,
            "[store]\nprovider = \"memory\"\n[web_search]\nmax_depth = 0\n",
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn s3_requires_bucket() {
        let dir = std::env::temp_dir().join("lexrag-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s3.toml");
        std::fs::write(&path, "[store]\nprovider = \"s3\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
