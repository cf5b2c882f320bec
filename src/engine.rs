//! Semantic search across named document collections.
//!
//! Each collection is a write-through structure: [`VectorSearchEngine::add`]
//! updates the in-memory index and marks the collection dirty; a background
//! synchronizer flushes dirty collections to the durable object store on a
//! configurable interval, and [`VectorSearchEngine::hydrate`] rebuilds the
//! index from the store at startup before any query is served.
//!
//! The in-memory index is a read-optimized projection, never the source of
//! truth — the object store owns collection state across restarts.
//!
//! Searching a collection with zero documents (or one that does not exist)
//! returns an empty result set, not an error.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::embedding::cosine_similarity;
use crate::models::{Document, DocumentType, ScoredDocument};
use crate::object_store::ObjectStore;
use crate::websearch::DomainAllowList;

/// Collections that always exist, mirroring the document taxonomy.
pub const DEFAULT_COLLECTIONS: [&str; 3] = ["case_law", "statutes", "regulations"];

/// Optional constraints applied during search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub doc_type: Option<DocumentType>,
    pub jurisdiction: Option<String>,
    /// Only documents dated on or after this date.
    pub since: Option<NaiveDate>,
}

/// Per-collection counts for the stats surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    pub documents: usize,
    pub embedded: usize,
}

struct CollectionState {
    documents: Vec<Arc<Document>>,
    dirty: bool,
}

/// Multi-collection nearest-neighbor search engine with durable backing.
pub struct VectorSearchEngine {
    collections: RwLock<HashMap<String, CollectionState>>,
    store: Arc<dyn ObjectStore>,
    prefix: String,
    sync_interval: Duration,
    allowlist: Arc<DomainAllowList>,
    /// Per-collection flush guards: at most one writer per collection is
    /// in flight against the store.
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VectorSearchEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: String,
        sync_interval: Duration,
        allowlist: Arc<DomainAllowList>,
    ) -> Arc<Self> {
        Arc::new(Self {
            collections: RwLock::new(HashMap::new()),
            store,
            prefix,
            sync_interval,
            allowlist,
            sync_locks: Mutex::new(HashMap::new()),
        })
    }

    fn doc_key(&self, collection: &str, doc_id: &str) -> String {
        format!("{}{}/{}.json", self.prefix, collection, doc_id)
    }

    /// Rebuild the in-memory index from the durable store.
    ///
    /// Must complete before queries are served. A store failure here is
    /// fatal to startup: with no hydrated data there is nothing to degrade
    /// to.
    pub async fn hydrate(&self) -> Result<usize> {
        let keys = self
            .store
            .list(&self.prefix)
            .await
            .context("Durable store unreachable during hydration")?;

        let mut loaded: HashMap<String, Vec<Arc<Document>>> = HashMap::new();
        let mut count = 0usize;

        for key in keys {
            let rel = match key.strip_prefix(&self.prefix) {
                Some(r) => r,
                None => continue,
            };
            let collection = match rel.split('/').next() {
                Some(c) if !c.is_empty() => c.to_string(),
                _ => continue,
            };

            let bytes = self
                .store
                .get(&key)
                .await
                .with_context(|| format!("Failed to fetch {} during hydration", key))?;
            match serde_json::from_slice::<Document>(&bytes) {
                Ok(doc) => {
                    loaded.entry(collection).or_default().push(Arc::new(doc));
                    count += 1;
                }
                Err(e) => {
                    // One corrupt object must not block startup.
                    tracing::warn!(key = %key, error = %e, "skipping undecodable document");
                }
            }
        }

        let mut collections = self.collections.write().await;
        collections.clear();
        for name in DEFAULT_COLLECTIONS {
            collections.insert(
                name.to_string(),
                CollectionState {
                    documents: Vec::new(),
                    dirty: false,
                },
            );
        }
        for (name, documents) in loaded {
            collections.insert(
                name,
                CollectionState {
                    documents,
                    dirty: false,
                },
            );
        }

        tracing::info!(documents = count, "collections hydrated from durable store");
        Ok(count)
    }

    /// Add a document to its collection, creating the collection on first
    /// use. Re-adding an existing id replaces the stored document. Marks
    /// the collection dirty for the next flush.
    pub async fn add(&self, document: Document) {
        let collection = document.collection.clone();
        let doc = Arc::new(document);

        let mut collections = self.collections.write().await;
        let state = collections
            .entry(collection)
            .or_insert_with(|| CollectionState {
                documents: Vec::new(),
                dirty: false,
            });
        state.documents.retain(|d| d.id != doc.id);
        state.documents.push(doc);
        state.dirty = true;
    }

    /// Nearest-neighbor search across the named collections, merged by
    /// score. Ties break by document recency, then source authority
    /// (authorized legal sources over generic web), then id for
    /// determinism.
    pub async fn search(
        &self,
        query_vector: &[f32],
        collection_names: &[String],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Vec<ScoredDocument> {
        let collections = self.collections.read().await;
        let mut hits: Vec<ScoredDocument> = Vec::new();

        for name in collection_names {
            let state = match collections.get(name) {
                Some(s) => s,
                // Unknown collection: informative "no matches", not an error.
                None => continue,
            };

            for doc in &state.documents {
                if !filters_match(filters, doc) {
                    continue;
                }
                let score = cosine_similarity(query_vector, &doc.embedding);
                hits.push(ScoredDocument {
                    document: doc.clone(),
                    score,
                });
            }
        }
        drop(collections);

        let allowlist = &self.allowlist;
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.document.recency().cmp(&a.document.recency()))
                .then_with(|| {
                    source_authority(&b.document, allowlist)
                        .cmp(&source_authority(&a.document, allowlist))
                })
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(top_k);
        hits
    }

    /// Force an immediate flush. With a collection name, that collection is
    /// written out whether dirty or not; with `None`, every dirty
    /// collection is flushed. Returns the names flushed.
    pub async fn sync(&self, collection: Option<&str>) -> Result<Vec<String>> {
        let targets: Vec<String> = match collection {
            Some(name) => vec![name.to_string()],
            None => {
                let collections = self.collections.read().await;
                collections
                    .iter()
                    .filter(|(_, state)| state.dirty)
                    .map(|(name, _)| name.clone())
                    .collect()
            }
        };

        let mut flushed = Vec::new();
        for name in targets {
            self.flush_collection(&name).await?;
            flushed.push(name);
        }
        Ok(flushed)
    }

    /// Write one collection's documents to the durable store.
    ///
    /// Writers are serialized per collection; the in-memory index stays
    /// readable throughout. The dirty flag is cleared before the snapshot
    /// is taken, so an `add` racing the flush re-marks the collection and
    /// the next cycle picks it up.
    async fn flush_collection(&self, name: &str) -> Result<()> {
        let guard = {
            let mut locks = self.sync_locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        let snapshot: Vec<Arc<Document>> = {
            let mut collections = self.collections.write().await;
            match collections.get_mut(name) {
                Some(state) => {
                    state.dirty = false;
                    state.documents.clone()
                }
                None => return Ok(()),
            }
        };

        for doc in &snapshot {
            let key = self.doc_key(name, &doc.id);
            let bytes = serde_json::to_vec(doc.as_ref())
                .with_context(|| format!("Failed to serialize document {}", doc.id))?;
            if let Err(e) = self.store.put(&key, bytes).await {
                // Leave the collection dirty so the next sync retries.
                let mut collections = self.collections.write().await;
                if let Some(state) = collections.get_mut(name) {
                    state.dirty = true;
                }
                return Err(e.context(format!("Flush of collection '{}' failed", name)));
            }
        }

        tracing::debug!(collection = %name, documents = snapshot.len(), "collection flushed");
        Ok(())
    }

    /// Remove a collection's documents from the index and the durable
    /// store. Returns the number of documents purged.
    pub async fn purge(&self, name: &str) -> Result<usize> {
        let removed: Vec<Arc<Document>> = {
            let mut collections = self.collections.write().await;
            match collections.get_mut(name) {
                Some(state) => {
                    state.dirty = false;
                    std::mem::take(&mut state.documents)
                }
                None => Vec::new(),
            }
        };

        for doc in &removed {
            self.store.delete(&self.doc_key(name, &doc.id)).await?;
        }
        Ok(removed.len())
    }

    /// Per-collection document counts.
    pub async fn stats(&self) -> BTreeMap<String, CollectionStats> {
        let collections = self.collections.read().await;
        collections
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    CollectionStats {
                        documents: state.documents.len(),
                        embedded: state
                            .documents
                            .iter()
                            .filter(|d| !d.embedding.is_empty())
                            .count(),
                    },
                )
            })
            .collect()
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let collections = self.collections.read().await;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn the background synchronizer: flushes dirty collections every
    /// sync interval, independent of request handling.
    pub fn spawn_sync_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.sync(None).await {
                    Ok(flushed) if !flushed.is_empty() => {
                        tracing::info!(collections = ?flushed, "background sync flushed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "background sync failed; will retry next interval");
                    }
                }
            }
        })
    }
}

fn filters_match(filters: &SearchFilters, doc: &Document) -> bool {
    if let Some(ty) = filters.doc_type {
        if doc.meta.doc_type != Some(ty) {
            return false;
        }
    }
    if let Some(ref jurisdiction) = filters.jurisdiction {
        match &doc.meta.jurisdiction {
            Some(j) if j.eq_ignore_ascii_case(jurisdiction) => {}
            _ => return false,
        }
    }
    if let Some(since) = filters.since {
        match doc.meta.date {
            Some(d) if d >= since => {}
            _ => return false,
        }
    }
    true
}

/// Source authority rank: curated corpus documents first, then authorized
/// web domains, then generic web.
fn source_authority(doc: &Document, allowlist: &DomainAllowList) -> u8 {
    match &doc.meta.source_url {
        None => 2,
        Some(url) if allowlist.is_authorized(url) => 1,
        Some(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMeta;
    use crate::object_store::MemoryObjectStore;
    use chrono::Utc;

    fn test_engine(store: Arc<dyn ObjectStore>) -> Arc<VectorSearchEngine> {
        VectorSearchEngine::new(
            store,
            "vector_db/".to_string(),
            Duration::from_secs(600),
            Arc::new(DomainAllowList::default_list()),
        )
    }

    fn doc(id: &str, collection: &str, embedding: Vec<f32>) -> Document {
        Document {
            id: id.to_string(),
            collection: collection.to_string(),
            raw_text: String::new(),
            text: format!("document {}", id),
            meta: DocumentMeta::default(),
            embedding,
            quality_score: 0.8,
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_collection_returns_empty_not_error() {
        let engine = test_engine(Arc::new(MemoryObjectStore::new()));
        engine.hydrate().await.unwrap();

        let hits = engine
            .search(
                &[1.0, 0.0],
                &["case_law".to_string(), "nonexistent".to_string()],
                5,
                &SearchFilters::default(),
            )
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_merges_collections_by_score() {
        let engine = test_engine(Arc::new(MemoryObjectStore::new()));
        engine.add(doc("a", "case_law", vec![1.0, 0.0])).await;
        engine.add(doc("b", "statutes", vec![0.9, 0.1])).await;
        engine.add(doc("c", "statutes", vec![0.0, 1.0])).await;

        let hits = engine
            .search(
                &[1.0, 0.0],
                &["case_law".to_string(), "statutes".to_string()],
                2,
                &SearchFilters::default(),
            )
            .await;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "a");
        assert_eq!(hits[1].document.id, "b");
    }

    #[tokio::test]
    async fn ties_break_by_recency_then_authority() {
        let engine = test_engine(Arc::new(MemoryObjectStore::new()));

        let mut older = doc("older", "case_law", vec![1.0, 0.0]);
        older.meta.date = NaiveDate::from_ymd_opt(1990, 1, 1);
        let mut newer = doc("newer", "case_law", vec![1.0, 0.0]);
        newer.meta.date = NaiveDate::from_ymd_opt(2020, 6, 1);
        engine.add(older).await;
        engine.add(newer).await;

        let hits = engine
            .search(
                &[1.0, 0.0],
                &["case_law".to_string()],
                2,
                &SearchFilters::default(),
            )
            .await;
        assert_eq!(hits[0].document.id, "newer");

        // Same score, same date: authorized domain outranks generic web.
        let engine = test_engine(Arc::new(MemoryObjectStore::new()));
        let date = NaiveDate::from_ymd_opt(2020, 6, 1);
        let mut authorized = doc("authorized", "web", vec![1.0, 0.0]);
        authorized.meta.date = date;
        authorized.meta.source_url =
            Some("https://www.law.cornell.edu/wex/due_process".to_string());
        let mut generic = doc("generic", "web", vec![1.0, 0.0]);
        generic.meta.date = date;
        generic.meta.source_url = Some("https://example.com/blog".to_string());
        engine.add(generic).await;
        engine.add(authorized).await;

        let hits = engine
            .search(
                &[1.0, 0.0],
                &["web".to_string()],
                2,
                &SearchFilters::default(),
            )
            .await;
        assert_eq!(hits[0].document.id, "authorized");
    }

    #[tokio::test]
    async fn add_sync_hydrate_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());

        let engine = test_engine(store.clone());
        engine.add(doc("d1", "statutes", vec![0.6, 0.8])).await;
        let flushed = engine.sync(Some("statutes")).await.unwrap();
        assert_eq!(flushed, vec!["statutes"]);

        // A fresh engine over the same store sees the document.
        let rehydrated = test_engine(store);
        let count = rehydrated.hydrate().await.unwrap();
        assert_eq!(count, 1);

        let hits = rehydrated
            .search(
                &[0.6, 0.8],
                &["statutes".to_string()],
                1,
                &SearchFilters::default(),
            )
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "d1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sync_none_flushes_only_dirty() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let engine = test_engine(store.clone());

        engine.add(doc("d1", "case_law", vec![1.0])).await;
        engine.sync(None).await.unwrap();
        // Now clean: nothing to flush.
        let flushed = engine.sync(None).await.unwrap();
        assert!(flushed.is_empty());

        engine.add(doc("d2", "case_law", vec![1.0])).await;
        let flushed = engine.sync(None).await.unwrap();
        assert_eq!(flushed, vec!["case_law"]);
    }

    #[tokio::test]
    async fn purge_empties_index_and_store() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let engine = test_engine(store.clone());

        engine.add(doc("d1", "regulations", vec![1.0])).await;
        engine.add(doc("d2", "regulations", vec![1.0])).await;
        engine.sync(Some("regulations")).await.unwrap();

        let purged = engine.purge("regulations").await.unwrap();
        assert_eq!(purged, 2);
        assert!(store.list("vector_db/regulations/").await.unwrap().is_empty());

        let hits = engine
            .search(
                &[1.0],
                &["regulations".to_string()],
                5,
                &SearchFilters::default(),
            )
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn filters_restrict_results() {
        let engine = test_engine(Arc::new(MemoryObjectStore::new()));
        let mut ny = doc("ny", "case_law", vec![1.0, 0.0]);
        ny.meta.jurisdiction = Some("New York".to_string());
        ny.meta.doc_type = Some(DocumentType::CaseLaw);
        let mut ca = doc("ca", "case_law", vec![1.0, 0.0]);
        ca.meta.jurisdiction = Some("California".to_string());
        ca.meta.doc_type = Some(DocumentType::CaseLaw);
        engine.add(ny).await;
        engine.add(ca).await;

        let filters = SearchFilters {
            jurisdiction: Some("new york".to_string()),
            ..SearchFilters::default()
        };
        let hits = engine
            .search(&[1.0, 0.0], &["case_law".to_string()], 5, &filters)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "ny");
    }
}
