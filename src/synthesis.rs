//! Research synthesis: from prioritized source documents to a cited answer.
//!
//! Candidates are ordered by source authority (authorized legal database
//! over general web), then recency, then semantic similarity; the top
//! bounded set is assembled into a structured prompt for the chat model.
//! The output contract requires four sections — legal principles,
//! application, limitations, next steps. An answer missing a section is
//! flagged `is_partial`, not rejected; so is an answer produced while the
//! chat capability was unavailable.
//!
//! Complete results are cached by normalized query text under the same TTL
//! discipline as embeddings; an identical query within TTL never reaches
//! the model.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::{synthesis_key, KvCache};
use crate::chat::ChatBackend;
use crate::models::{ResearchResult, ScoredDocument, SourceRef};
use crate::websearch::DomainAllowList;

/// Section headings the model is required to produce.
const REQUIRED_SECTIONS: [&str; 4] = [
    "legal principles",
    "application",
    "limitations",
    "next steps",
];

pub struct ResearchSynthesisChain {
    chat: Arc<dyn ChatBackend>,
    kv: Arc<KvCache>,
    allowlist: Arc<DomainAllowList>,
    max_context_docs: usize,
    /// Per-query guards: concurrent identical queries issue one model call
    /// and share the cached result.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResearchSynthesisChain {
    pub fn new(
        chat: Arc<dyn ChatBackend>,
        kv: Arc<KvCache>,
        allowlist: Arc<DomainAllowList>,
        max_context_docs: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            chat,
            kv,
            allowlist,
            max_context_docs,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Look up a previously synthesized answer for an identical
    /// (normalized) query. Lets the orchestrator skip retrieval entirely
    /// on a hit.
    pub async fn cached(&self, query: &str) -> Option<ResearchResult> {
        self.kv
            .get_json::<ResearchResult>(&synthesis_key(query))
            .await
    }

    /// Synthesize a cited answer from candidate documents.
    ///
    /// `context` carries accumulated conversation context and is injected
    /// into the prompt so follow-up questions resolve against prior turns.
    pub async fn synthesize(
        &self,
        query: &str,
        candidates: Vec<ScoredDocument>,
        context: &[String],
    ) -> Result<ResearchResult> {
        let cache_key = synthesis_key(query);
        if let Some(cached) = self.kv.get_json::<ResearchResult>(&cache_key).await {
            tracing::debug!(query, "synthesis served from cache");
            return Ok(cached);
        }

        // Coalesce concurrent identical queries onto one model call.
        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(cache_key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        if let Some(cached) = self.kv.get_json::<ResearchResult>(&cache_key).await {
            return Ok(cached);
        }

        let prioritized = self.prioritize(candidates);
        let sources: Vec<SourceRef> = prioritized.iter().map(|c| self.source_ref(c)).collect();
        let prompt = self.build_prompt(query, &prioritized, context);

        let raw_output = match self.chat.chat(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                // Upstream exhausted its retries: degrade to a labeled
                // partial result instead of failing the query.
                tracing::warn!(error = %e, "synthesis model unavailable, returning partial result");
                return Ok(ResearchResult {
                    query: query.to_string(),
                    synthesis: unavailable_synthesis(&sources),
                    sources,
                    raw_model_output: String::new(),
                    is_partial: true,
                    generated_at: Utc::now(),
                });
            }
        };

        let missing = missing_sections(&raw_output);
        let is_partial = !missing.is_empty();
        if is_partial {
            tracing::warn!(?missing, "synthesis output missing required sections");
        }

        let result = ResearchResult {
            query: query.to_string(),
            synthesis: raw_output.clone(),
            sources,
            raw_model_output: raw_output,
            is_partial,
            generated_at: Utc::now(),
        };

        // Partial answers are not cached: a transient degradation should
        // not be pinned for a full TTL.
        if !is_partial {
            if let Err(e) = self.kv.set_json(&cache_key, &result).await {
                tracing::warn!(error = %e, "failed to cache synthesis result");
            }
        }

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&cache_key);
        }

        Ok(result)
    }

    /// Order candidates by source authority, then recency, then
    /// similarity score, and truncate to the context budget.
    pub fn prioritize(&self, mut candidates: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
        candidates.sort_by(|a, b| {
            self.authority(b)
                .cmp(&self.authority(a))
                .then_with(|| b.document.recency().cmp(&a.document.recency()))
                .then_with(|| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        candidates.truncate(self.max_context_docs);
        candidates
    }

    fn authority(&self, candidate: &ScoredDocument) -> u8 {
        match &candidate.document.meta.source_url {
            None => 2,
            Some(url) if self.allowlist.is_authorized(url) => 1,
            Some(_) => 0,
        }
    }

    fn source_ref(&self, candidate: &ScoredDocument) -> SourceRef {
        let doc = &candidate.document;
        let snippet: String = doc.text.chars().take(240).collect();
        let source = match &doc.meta.source_url {
            Some(url) => reqwest::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| "web".to_string()),
            None => "internal database".to_string(),
        };
        SourceRef {
            title: doc
                .meta
                .title
                .clone()
                .or_else(|| doc.meta.case_name.clone())
                .unwrap_or_else(|| format!("Document {}", doc.id)),
            url: doc.meta.source_url.clone(),
            snippet,
            source,
        }
    }

    fn build_prompt(
        &self,
        query: &str,
        candidates: &[ScoredDocument],
        context: &[String],
    ) -> String {
        let mut doc_context = String::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let doc = &candidate.document;
            let origin = doc
                .meta
                .source_url
                .as_deref()
                .unwrap_or("internal legal database");
            let excerpt: String = doc.text.chars().take(1000).collect();
            doc_context.push_str(&format!(
                "DOCUMENT {} [{}]\nSource: {}\n{}\n\n",
                i + 1,
                doc.meta
                    .doc_type
                    .map(|t| t.as_str())
                    .unwrap_or("unclassified"),
                origin,
                excerpt
            ));
        }
        if doc_context.is_empty() {
            doc_context.push_str("(no source documents were available)\n");
        }

        let mut prior = String::new();
        if !context.is_empty() {
            prior.push_str("ESTABLISHED RESEARCH CONTEXT FROM THIS CONVERSATION:\n");
            for entry in context {
                prior.push_str(entry);
                prior.push('\n');
            }
            prior.push('\n');
        }

        format!(
            "You are a specialized legal research assistant that synthesizes \
information from legal databases and authorized sources.\n\n\
CLIENT QUERY: {query}\n\n\
{prior}SOURCE DOCUMENTS:\n{doc_context}\
Based on these sources, write a research synthesis with exactly these \
four sections, using these headings:\n\
1. LEGAL PRINCIPLES — the relevant legal principles, statutes, \
regulations, or cases identified\n\
2. APPLICATION — how they apply to the client's situation\n\
3. LIMITATIONS — limitations of this analysis and areas needing further \
research\n\
4. NEXT STEPS — practical next steps or considerations for the client\n\n\
Your synthesis must be factual, balanced, and attribute every claim to a \
source."
        )
    }
}

/// Synthesis body used when the chat capability is unavailable.
fn unavailable_synthesis(sources: &[SourceRef]) -> String {
    let mut text = String::from(
        "The synthesis service is temporarily unavailable; this is a partial \
result. The following sources were identified for this query and can be \
reviewed directly:\n",
    );
    for source in sources {
        match &source.url {
            Some(url) => text.push_str(&format!("- {} ({})\n", source.title, url)),
            None => text.push_str(&format!("- {} [{}]\n", source.title, source.source)),
        }
    }
    text
}

/// The required sections absent from a model output.
fn missing_sections(output: &str) -> Vec<&'static str> {
    let lower = output.to_lowercase();
    REQUIRED_SECTIONS
        .iter()
        .filter(|section| !lower.contains(**section))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvCache;
    use crate::config::CacheConfig;
    use crate::models::{Document, DocumentMeta};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COMPLETE_OUTPUT: &str = "\
1. LEGAL PRINCIPLES\nThe Fair Housing Act applies.\n\
2. APPLICATION\nFor this tenant it means...\n\
3. LIMITATIONS\nState law varies.\n\
4. NEXT STEPS\nContact a local attorney.";

    struct ScriptedChat {
        output: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedChat {
        fn new(output: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                output,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.output {
                Some(text) => Ok(text.to_string()),
                None => Err(anyhow::anyhow!("model unreachable")),
            }
        }
    }

    fn kv() -> Arc<KvCache> {
        KvCache::local_only(&CacheConfig::default())
    }

    fn chain(chat: Arc<ScriptedChat>) -> Arc<ResearchSynthesisChain> {
        ResearchSynthesisChain::new(
            chat,
            kv(),
            Arc::new(DomainAllowList::default_list()),
            5,
        )
    }

    fn candidate(id: &str, url: Option<&str>, date: (i32, u32, u32), score: f32) -> ScoredDocument {
        ScoredDocument {
            document: Arc::new(Document {
                id: id.to_string(),
                collection: "case_law".to_string(),
                raw_text: String::new(),
                text: format!("text of {}", id),
                meta: DocumentMeta {
                    source_url: url.map(|u| u.to_string()),
                    date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
                    ..DocumentMeta::default()
                },
                embedding: vec![],
                quality_score: 0.5,
                added_at: Utc::now(),
            }),
            score,
        }
    }

    #[test]
    fn prioritize_orders_authority_recency_similarity() {
        let chain = chain(ScriptedChat::new(Some(COMPLETE_OUTPUT)));

        let generic_web = candidate("web", Some("https://example.com/x"), (2024, 1, 1), 0.99);
        let authorized = candidate(
            "authorized",
            Some("https://law.cornell.edu/x"),
            (2020, 1, 1),
            0.50,
        );
        let internal_old = candidate("internal-old", None, (1990, 1, 1), 0.10);
        let internal_new = candidate("internal-new", None, (2021, 1, 1), 0.05);

        let ordered = chain.prioritize(vec![
            generic_web.clone(),
            authorized.clone(),
            internal_old.clone(),
            internal_new.clone(),
        ]);

        let ids: Vec<&str> = ordered.iter().map(|c| c.document.id.as_str()).collect();
        // Internal corpus first (newer before older), then authorized web,
        // then generic web regardless of its similarity score.
        assert_eq!(ids, vec!["internal-new", "internal-old", "authorized", "web"]);
    }

    #[test]
    fn prioritize_respects_context_budget() {
        let chain = chain(ScriptedChat::new(Some(COMPLETE_OUTPUT)));
        let candidates: Vec<ScoredDocument> = (0..12)
            .map(|i| candidate(&format!("d{}", i), None, (2020, 1, 1), 0.5))
            .collect();
        assert_eq!(chain.prioritize(candidates).len(), 5);
    }

    #[test]
    fn detects_missing_sections() {
        assert!(missing_sections(COMPLETE_OUTPUT).is_empty());

        let partial = "1. LEGAL PRINCIPLES\nSome law.\n2. APPLICATION\nApplies.";
        let missing = missing_sections(partial);
        assert_eq!(missing, vec!["limitations", "next steps"]);
    }

    #[tokio::test]
    async fn complete_output_is_cached_and_short_circuits() {
        let chat = ScriptedChat::new(Some(COMPLETE_OUTPUT));
        let chain = chain(chat.clone());

        let first = chain
            .synthesize("tenant rights", vec![], &[])
            .await
            .unwrap();
        assert!(!first.is_partial);

        let second = chain
            .synthesize("tenant  rights", vec![], &[])
            .await
            .unwrap();
        assert_eq!(second.synthesis, first.synthesis);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn incomplete_output_is_flagged_and_not_cached() {
        let chat = ScriptedChat::new(Some("1. LEGAL PRINCIPLES\nonly this"));
        let chain = chain(chat.clone());

        let first = chain.synthesize("q", vec![], &[]).await.unwrap();
        assert!(first.is_partial);

        chain.synthesize("q", vec![], &[]).await.unwrap();
        // Not cached: the model is consulted again.
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn model_outage_returns_partial_with_sources() {
        let chat = ScriptedChat::new(None);
        let chain = chain(chat);

        let candidates = vec![candidate(
            "doc",
            Some("https://law.cornell.edu/wex/tenant"),
            (2020, 1, 1),
            0.9,
        )];
        let result = chain
            .synthesize("tenant rights", candidates, &[])
            .await
            .unwrap();

        assert!(result.is_partial);
        assert_eq!(result.sources.len(), 1);
        assert!(result.synthesis.contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn context_is_injected_into_prompt() {
        struct CapturingChat(std::sync::Mutex<String>);

        #[async_trait]
        impl ChatBackend for CapturingChat {
            fn model_id(&self) -> &str {
                "capturing"
            }
            async fn chat(&self, prompt: &str) -> Result<String> {
                *self.0.lock().unwrap() = prompt.to_string();
                Ok(COMPLETE_OUTPUT.to_string())
            }
        }

        let chat = Arc::new(CapturingChat(std::sync::Mutex::new(String::new())));
        let chain = ResearchSynthesisChain::new(
            chat.clone(),
            kv(),
            Arc::new(DomainAllowList::default_list()),
            5,
        );

        chain
            .synthesize(
                "what about tenants with children?",
                vec![],
                &["Prior topic: New Jersey eviction law".to_string()],
            )
            .await
            .unwrap();

        let prompt = chat.0.lock().unwrap().clone();
        assert!(prompt.contains("New Jersey eviction law"));
        assert!(prompt.contains("NEXT STEPS"));
    }
}
