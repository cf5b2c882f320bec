//! Research orchestration.
//!
//! One query's path through the system: cached-result check → query
//! embedding → multi-collection vector search → web search when coverage
//! is thin → durable flush of web-derived documents → prioritized
//! synthesis → conversation memory. Vector search always completes (or
//! fails) before synthesis is invoked, and web-derived documents are only
//! offered to synthesis after they have been flushed to the durable store.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{EmbeddingCache, KvCache};
use crate::chat::ChatBackend;
use crate::config::Config;
use crate::embedding::{cosine_similarity, EmbedInput};
use crate::engine::{SearchFilters, VectorSearchEngine, DEFAULT_COLLECTIONS};
use crate::memory::ConversationMemory;
use crate::models::{ResearchQuery, ResearchResult, ScoredDocument};
use crate::pipeline::DataPipeline;
use crate::synthesis::ResearchSynthesisChain;
use crate::websearch::{DomainAllowList, SerpApiProvider, WebSearchModule};
use crate::{chat, embedding, object_store};

/// Parameters for one research query.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub query: String,
    /// Collections to search; the full taxonomy when unset.
    pub collections: Option<Vec<String>>,
    pub use_web_search: bool,
    pub max_web_results: usize,
    /// Session to read context from and record the turn into.
    pub conversation_id: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            collections: None,
            use_web_search: true,
            max_web_results: 5,
            conversation_id: None,
        }
    }
}

/// The research agent: ties the engine, web search, synthesis chain, and
/// conversation memory together behind the exposed operations.
pub struct ResearchAgent {
    cache: Arc<EmbeddingCache>,
    engine: Arc<VectorSearchEngine>,
    websearch: Option<Arc<WebSearchModule>>,
    synthesis: Arc<ResearchSynthesisChain>,
    chat: Arc<dyn ChatBackend>,
    memory: Arc<ConversationMemory>,
    top_k: usize,
    min_hits_before_web: usize,
}

impl ResearchAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<EmbeddingCache>,
        engine: Arc<VectorSearchEngine>,
        websearch: Option<Arc<WebSearchModule>>,
        synthesis: Arc<ResearchSynthesisChain>,
        chat: Arc<dyn ChatBackend>,
        memory: Arc<ConversationMemory>,
        top_k: usize,
        min_hits_before_web: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            engine,
            websearch,
            synthesis,
            chat,
            memory,
            top_k,
            min_hits_before_web,
        })
    }

    pub fn memory(&self) -> Arc<ConversationMemory> {
        Arc::clone(&self.memory)
    }

    pub fn engine(&self) -> Arc<VectorSearchEngine> {
        Arc::clone(&self.engine)
    }

    /// Run one research query end to end.
    pub async fn query(&self, request: ResearchRequest) -> Result<ResearchResult> {
        let focus = research_focus(&request.query);
        tracing::info!(query = %request.query, domains = ?focus.domains, "research query");

        // An identical cached query skips every upstream call.
        if let Some(cached) = self.synthesis.cached(&request.query).await {
            let result = cached;
            self.record_turn(&request, &result).await;
            return Ok(result);
        }

        let query_vector = self
            .cache
            .get_or_compute(&request.query, EmbedInput::Query)
            .await
            .context("Query embedding failed")?;

        let collections: Vec<String> = request
            .collections
            .clone()
            .unwrap_or_else(|| DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect());

        // Vector search completes before synthesis is considered.
        let mut candidates = self
            .engine
            .search(
                &query_vector,
                &collections,
                self.top_k * collections.len().max(1),
                &SearchFilters::default(),
            )
            .await;

        // Thin coverage (or a long, specific question) pulls in web search.
        let thin = candidates.len() < self.min_hits_before_web
            || request.query.split_whitespace().count() > 4;
        if request.use_web_search && thin {
            if let Some(websearch) = &self.websearch {
                match websearch
                    .search_and_process(&request.query, None, request.max_web_results, false)
                    .await
                {
                    Ok((documents, stats)) => {
                        tracing::info!(
                            found = stats.urls_found,
                            authorized = stats.urls_authorized,
                            processed = stats.documents_processed,
                            fallback = stats.fallback_used,
                            "web search finished"
                        );
                        // Web documents must be durable before they are
                        // eligible as synthesis inputs.
                        match self.engine.sync(None).await {
                            Ok(_) => {
                                let known: HashSet<String> = candidates
                                    .iter()
                                    .map(|c| c.document.id.clone())
                                    .collect();
                                for doc in documents {
                                    if known.contains(&doc.id) {
                                        continue;
                                    }
                                    let score =
                                        cosine_similarity(&query_vector, &doc.embedding);
                                    candidates.push(ScoredDocument {
                                        document: doc,
                                        score,
                                    });
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    "durable flush failed; web documents excluded from synthesis"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "web search failed, continuing with vector results");
                    }
                }
            }
        }

        let context = match &request.conversation_id {
            Some(id) => self.memory.get_context(id).await,
            None => Vec::new(),
        };

        let result = self
            .synthesis
            .synthesize(&request.query, candidates, &context)
            .await?;

        self.record_turn(&request, &result).await;
        Ok(result)
    }

    async fn record_turn(&self, request: &ResearchRequest, result: &ResearchResult) {
        if let Some(id) = &request.conversation_id {
            self.memory.append(id, &request.query, result).await;
        }
    }

    /// Conversational interface: no retrieval, optional accumulated
    /// context, returns the reply plus the session id.
    pub async fn chat(
        &self,
        message: &str,
        conversation_id: Option<String>,
        include_context: bool,
    ) -> Result<(String, String)> {
        let session_id = match conversation_id {
            Some(id) => id,
            None => self.memory.create_session().await,
        };

        let mut prompt = String::from(
            "You are a legal research assistant. Answer the client's message \
helpfully and note when a question needs jurisdiction-specific research.\n\n",
        );
        if include_context {
            let context = self.memory.get_context(&session_id).await;
            if !context.is_empty() {
                prompt.push_str("CONVERSATION CONTEXT:\n");
                for entry in &context {
                    prompt.push_str(entry);
                    prompt.push('\n');
                }
                prompt.push('\n');
            }
        }
        prompt.push_str("CLIENT MESSAGE: ");
        prompt.push_str(message);

        let text = self.chat.chat(&prompt).await.context("Chat call failed")?;

        let result = ResearchResult {
            query: message.to_string(),
            synthesis: text.clone(),
            sources: vec![],
            raw_model_output: text.clone(),
            is_partial: false,
            generated_at: chrono::Utc::now(),
        };
        self.memory.append(&session_id, message, &result).await;

        Ok((text, session_id))
    }
}

/// Keyword/heuristic research-focus extraction: legal domains, concepts,
/// and search keywords for a raw question. No model call involved.
pub fn research_focus(query: &str) -> ResearchQuery {
    const DOMAIN_LEXICON: [(&str, &[&str]); 7] = [
        (
            "housing",
            &["tenant", "landlord", "lease", "eviction", "rent", "housing"],
        ),
        (
            "employment",
            &["employer", "employee", "fired", "wage", "workplace", "discrimination"],
        ),
        (
            "privacy",
            &["privacy", "surveillance", "search", "seizure", "wiretap"],
        ),
        (
            "constitutional",
            &["amendment", "constitution", "due process", "equal protection", "speech"],
        ),
        (
            "municipal",
            &["parking", "ticket", "ordinance", "permit", "zoning", "citation"],
        ),
        (
            "family",
            &["divorce", "custody", "child support", "adoption"],
        ),
        (
            "contracts",
            &["contract", "breach", "agreement", "warranty"],
        ),
    ];

    const CONCEPTS: [&str; 8] = [
        "statute of limitations",
        "due process",
        "equal protection",
        "implied warranty",
        "fourth amendment",
        "first amendment",
        "burden of proof",
        "class action",
    ];

    const STOPWORDS: [&str; 18] = [
        "what", "are", "is", "the", "my", "a", "an", "of", "for", "to", "in", "on", "as", "can",
        "do", "does", "with", "about",
    ];

    let lower = query.to_lowercase();

    let domains: Vec<String> = DOMAIN_LEXICON
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(domain, _)| domain.to_string())
        .collect();

    let concepts: Vec<String> = CONCEPTS
        .iter()
        .filter(|c| lower.contains(*c))
        .map(|c| c.to_string())
        .collect();

    let keywords: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect();

    ResearchQuery {
        raw: query.to_string(),
        domains,
        concepts,
        keywords,
    }
}

/// Everything a front end (CLI command or HTTP server) needs, wired
/// together with explicit lifecycles — no globals, no import-time side
/// effects.
pub struct Services {
    pub agent: Arc<ResearchAgent>,
    pub engine: Arc<VectorSearchEngine>,
    pub pipeline: Arc<DataPipeline>,
    pub websearch: Option<Arc<WebSearchModule>>,
    pub memory: Arc<ConversationMemory>,
    pub cache: Arc<EmbeddingCache>,
    pub kv: Arc<KvCache>,
}

impl Services {
    /// Build and hydrate the full service graph.
    ///
    /// Fatal conditions surface here and abort startup: missing
    /// credentials, an unknown provider name, or a durable store that
    /// cannot be reached for hydration.
    pub async fn init(config: &Config) -> Result<Services> {
        let allowlist = Arc::new(DomainAllowList::load(&config.web_search)?);

        let store = object_store::create_store(&config.store)?;
        let engine = VectorSearchEngine::new(
            store,
            config.store.prefix.clone(),
            Duration::from_secs(config.store.sync_interval_secs),
            Arc::clone(&allowlist),
        );
        engine.hydrate().await?;

        let kv = KvCache::connect(&config.cache).await;
        let embedder = embedding::create_backend(&config.embedding)?;
        let cache = EmbeddingCache::new(Arc::clone(&kv), embedder);

        let pipeline = DataPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&engine),
            config.pipeline.clone(),
        );

        let websearch = match config.web_search.provider.as_str() {
            "disabled" => None,
            _ => {
                let provider = Arc::new(SerpApiProvider::new(&config.web_search)?);
                Some(WebSearchModule::new(
                    provider,
                    Arc::clone(&allowlist),
                    Arc::clone(&pipeline),
                    &config.web_search,
                )?)
            }
        };

        let chat_backend = chat::create_backend(&config.chat)?;
        let synthesis = ResearchSynthesisChain::new(
            Arc::clone(&chat_backend),
            Arc::clone(&kv),
            Arc::clone(&allowlist),
            config.retrieval.max_context_docs,
        );
        let memory = ConversationMemory::new();

        let agent = ResearchAgent::new(
            Arc::clone(&cache),
            Arc::clone(&engine),
            websearch.clone(),
            synthesis,
            chat_backend,
            Arc::clone(&memory),
            config.retrieval.top_k,
            config.retrieval.min_hits_before_web,
        );

        Ok(Services {
            agent,
            engine,
            pipeline,
            websearch,
            memory,
            cache,
            kv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_detects_housing_domain() {
        let focus = research_focus("What are my rights as a tenant?");
        assert!(focus.domains.contains(&"housing".to_string()));
        assert!(focus.keywords.contains(&"rights".to_string()));
        assert!(focus.keywords.contains(&"tenant".to_string()));
        assert!(!focus.keywords.contains(&"what".to_string()));
    }

    #[test]
    fn focus_detects_concepts() {
        let focus = research_focus("Does the statute of limitations bar my claim?");
        assert!(focus
            .concepts
            .contains(&"statute of limitations".to_string()));
    }

    #[test]
    fn focus_on_nonlegal_query_is_empty_of_domains() {
        let focus = research_focus("best chocolate chip cookie recipe");
        assert!(focus.domains.is_empty());
        assert!(focus.concepts.is_empty());
    }
}
