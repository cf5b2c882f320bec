//! Core data models used throughout the research pipeline.
//!
//! These types represent the documents, search hits, and research results
//! that flow from ingestion through vector search to synthesis.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Legal document category. Every document is classified into exactly one
/// variant; classification and prioritization sites match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    CaseLaw,
    Statute,
    Regulation,
    Web,
}

impl DocumentType {
    /// The collection this document type is stored in by default.
    pub fn default_collection(&self) -> &'static str {
        match self {
            DocumentType::CaseLaw => "case_law",
            DocumentType::Statute => "statutes",
            DocumentType::Regulation => "regulations",
            DocumentType::Web => "web",
        }
    }

    /// Map a collection name back to the document type it holds.
    pub fn from_collection(collection: &str) -> DocumentType {
        match collection {
            "case_law" => DocumentType::CaseLaw,
            "statutes" => DocumentType::Statute,
            "regulations" => DocumentType::Regulation,
            _ => DocumentType::Web,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::CaseLaw => "case_law",
            DocumentType::Statute => "statute",
            DocumentType::Regulation => "regulation",
            DocumentType::Web => "web",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured metadata extracted from a document's text.
///
/// Only `doc_type` is reliably present; the rest depends on what the
/// extraction patterns find in the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_type: Option<DocumentType>,
    pub title: Option<String>,
    pub jurisdiction: Option<String>,
    pub date: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub case_name: Option<String>,
    pub court: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub judges: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    pub statute_title: Option<String>,
    pub effective_date: Option<String>,
    pub cfr_reference: Option<String>,
    pub agency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    pub content_hash: Option<String>,
    #[serde(default)]
    pub word_count: usize,
}

/// A processed document as stored in a collection and in the durable store.
///
/// Immutable once embedded; destroyed only by explicit collection purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection: String,
    /// Text as extracted from the source, before cleanup.
    pub raw_text: String,
    /// Normalized text: boilerplate dropped, whitespace collapsed.
    pub text: String,
    pub meta: DocumentMeta,
    pub embedding: Vec<f32>,
    pub quality_score: f32,
    pub added_at: DateTime<Utc>,
}

impl Document {
    /// Best-available date for recency ordering: the extracted document
    /// date, falling back to ingestion time.
    pub fn recency(&self) -> DateTime<Utc> {
        self.meta
            .date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(self.added_at)
    }
}

/// A search hit: a document plus its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: std::sync::Arc<Document>,
    pub score: f32,
}

/// Research focus derived from a raw question. Not persisted beyond the
/// request/response cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResearchQuery {
    pub raw: String,
    pub domains: Vec<String>,
    pub concepts: Vec<String>,
    pub keywords: Vec<String>,
}

/// A cited source attached to a synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: Option<String>,
    pub snippet: String,
    pub source: String,
}

/// The synthesized answer for one research query. Cached keyed by the
/// normalized query text; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub query: String,
    pub synthesis: String,
    pub sources: Vec<SourceRef>,
    pub raw_model_output: String,
    /// Set when the model output was missing a required section or the
    /// answer was produced under degraded upstream availability.
    pub is_partial: bool,
    pub generated_at: DateTime<Utc>,
}

/// One query/answer exchange within a conversation session.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub query: String,
    pub synthesis: String,
    pub asked_at: DateTime<Utc>,
}

/// A conversation session: prior turns plus explicitly added research
/// context. Partitioned strictly by session id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationSession {
    pub id: String,
    pub turns: Vec<ConversationTurn>,
    pub context: Vec<String>,
}

/// Batch ingestion statistics. A failure in one document never aborts the
/// batch; it is recorded here instead.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Documents rejected by quality verification, not by errors.
    pub skipped: usize,
    pub errors: Vec<PipelineError>,
}

/// A single per-document failure recorded during batch processing.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineError {
    pub source: String,
    pub error: String,
}

/// Statistics for one web search-and-process run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebSearchStats {
    pub urls_found: usize,
    pub urls_authorized: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub documents_processed: usize,
    /// True when the provider failed or returned nothing on authorized
    /// domains and the built-in fallback documents were used instead.
    pub fallback_used: bool,
}
