//! Document ingestion pipeline.
//!
//! Orchestrates the flow from raw sources into searchable collections:
//! extract text → normalize → extract metadata → embed (through the
//! cache) → verify quality → add to the vector engine. Each stage fails
//! independently; a bad document is recorded in the batch statistics and
//! never aborts the rest of the batch.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::cache::EmbeddingCache;
use crate::config::PipelineConfig;
use crate::engine::VectorSearchEngine;
use crate::extract;
use crate::metadata::MetadataExtractor;
use crate::models::{Document, DocumentMeta, PipelineError, PipelineStats};

/// A source ready for the normalize/classify/embed stages: text is already
/// extracted from its container format.
#[derive(Debug, Clone)]
pub struct RawSource {
    /// File path or URL, used in ids, logs, and error records.
    pub name: String,
    pub text: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
}

/// Outcome of processing one source.
pub enum ProcessOutcome {
    Accepted(Arc<Document>),
    /// Failed quality verification; recorded as skipped, not an error.
    Rejected(String),
}

/// The ingestion pipeline. Owns document creation: nothing else in the
/// system constructs a [`Document`].
pub struct DataPipeline {
    cache: Arc<EmbeddingCache>,
    engine: Arc<VectorSearchEngine>,
    extractor: Arc<MetadataExtractor>,
    config: PipelineConfig,
}

impl DataPipeline {
    pub fn new(
        cache: Arc<EmbeddingCache>,
        engine: Arc<VectorSearchEngine>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            engine,
            extractor: Arc::new(MetadataExtractor::new()),
            config,
        })
    }

    /// Process a single file into the given collection.
    pub async fn process(&self, path: &Path, collection: &str) -> Result<ProcessOutcome> {
        let extracted = extract::extract_file(path)
            .with_context(|| format!("Extraction failed for {}", path.display()))?;
        let raw = RawSource {
            name: path.display().to_string(),
            text: extracted.text,
            title: extracted.title,
            source_url: None,
        };
        self.process_raw(raw, Some(collection)).await
    }

    /// Process extracted text. When `collection` is `None` (web-derived
    /// sources), classification picks the destination; text that does not
    /// classify as legal material is rejected.
    pub async fn process_raw(
        &self,
        raw: RawSource,
        collection: Option<&str>,
    ) -> Result<ProcessOutcome> {
        // Stage: normalize.
        let text = normalize_text(&raw.text, self.config.max_chars);
        if text.is_empty() {
            return Ok(ProcessOutcome::Rejected("no text after cleanup".to_string()));
        }

        // Stage: metadata extraction.
        let seed = DocumentMeta {
            title: raw.title.clone(),
            source_url: raw.source_url.clone(),
            ..DocumentMeta::default()
        };
        let meta = self
            .extractor
            .extract(&text, seed, collection.unwrap_or_default());

        let destination = match collection {
            Some(name) => name.to_string(),
            None => match meta.doc_type {
                Some(ty) => ty.default_collection().to_string(),
                None => {
                    return Ok(ProcessOutcome::Rejected(
                        "does not classify as a legal document".to_string(),
                    ))
                }
            },
        };

        // Stage: embed, through the cache.
        let embedding = self
            .cache
            .get_or_compute(&text, crate::embedding::EmbedInput::Document)
            .await
            .with_context(|| format!("Embedding failed for {}", raw.name))?;

        // Stage: verify.
        if let Err(reason) = self.verify(&meta, &embedding) {
            tracing::debug!(source = %raw.name, reason = %reason, "document rejected");
            return Ok(ProcessOutcome::Rejected(reason));
        }

        let quality_score = self.extractor.quality_score(&meta);
        let id = document_id(&destination, &meta);

        let document = Document {
            id,
            collection: destination,
            raw_text: raw.text,
            text,
            meta,
            embedding,
            quality_score,
            added_at: Utc::now(),
        };

        let document = Arc::new(document);
        self.engine.add(document.as_ref().clone()).await;
        Ok(ProcessOutcome::Accepted(document))
    }

    /// Quality verification: minimum word count, embedding dimensionality,
    /// and a distribution sanity check on the vector.
    fn verify(&self, meta: &DocumentMeta, embedding: &[f32]) -> std::result::Result<(), String> {
        if meta.word_count < self.config.min_word_count {
            return Err(format!(
                "below minimum word count ({} < {})",
                meta.word_count, self.config.min_word_count
            ));
        }
        if embedding.len() != self.cache.dims() {
            return Err(format!(
                "embedding dimensionality mismatch ({} != {})",
                embedding.len(),
                self.cache.dims()
            ));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err("embedding contains non-finite values".to_string());
        }
        if embedding.iter().all(|v| *v == 0.0) {
            return Err("embedding is all zeros".to_string());
        }
        Ok(())
    }

    /// Process every supported file under `source_dir` into `collection`.
    ///
    /// Work is partitioned into batches and fanned out over a bounded
    /// worker pool. Failures accumulate in the returned statistics. The
    /// collection is flushed to the durable store once at the end so a
    /// completed ingest survives a restart.
    pub async fn process_documents(
        self: &Arc<Self>,
        source_dir: &Path,
        collection: &str,
        batch_size: usize,
        recursive: bool,
    ) -> Result<PipelineStats> {
        if !source_dir.is_dir() {
            anyhow::bail!("Source directory {} does not exist", source_dir.display());
        }

        let include = build_globset(&self.config.include_globs)?;
        let files = scan_files(source_dir, recursive, &include);
        tracing::info!(
            dir = %source_dir.display(),
            files = files.len(),
            collection,
            "starting ingestion"
        );

        let mut stats = PipelineStats::default();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));

        for batch in files.chunks(batch_size.max(1)) {
            let mut tasks: JoinSet<(PathBuf, Result<ProcessOutcome>)> = JoinSet::new();

            for path in batch {
                let pipeline = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let path = path.clone();
                let collection = collection.to_string();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let outcome = pipeline.process(&path, &collection).await;
                    (path, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                stats.processed += 1;
                match joined {
                    Ok((_, Ok(ProcessOutcome::Accepted(_)))) => stats.succeeded += 1,
                    Ok((path, Ok(ProcessOutcome::Rejected(reason)))) => {
                        stats.skipped += 1;
                        stats.errors.push(PipelineError {
                            source: path.display().to_string(),
                            error: format!("skipped: {}", reason),
                        });
                    }
                    Ok((path, Err(e))) => {
                        stats.failed += 1;
                        stats.errors.push(PipelineError {
                            source: path.display().to_string(),
                            error: e.to_string(),
                        });
                    }
                    Err(join_err) => {
                        stats.failed += 1;
                        stats.errors.push(PipelineError {
                            source: "(worker)".to_string(),
                            error: join_err.to_string(),
                        });
                    }
                }
            }
        }

        if stats.succeeded > 0 {
            self.engine
                .sync(Some(collection))
                .await
                .context("Post-ingest flush failed")?;
        }

        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "ingestion finished"
        );
        Ok(stats)
    }
}

/// Normalize extracted text: trim lines, drop empties, collapse interior
/// whitespace, truncate to the configured budget on a char boundary.
pub fn normalize_text(text: &str, max_chars: usize) -> String {
    let joined = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let collapsed = joined
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    collapsed.chars().take(max_chars).collect()
}

/// Deterministic document id: collection plus a content-hash prefix, so
/// re-ingesting identical content replaces rather than duplicates.
fn document_id(collection: &str, meta: &DocumentMeta) -> String {
    match &meta.content_hash {
        Some(hash) => format!("{}_{}", collection, &hash[..10.min(hash.len())]),
        None => format!("{}_{}", collection, uuid::Uuid::new_v4()),
    }
}

fn scan_files(root: &Path, recursive: bool, include: &GlobSet) -> Vec<PathBuf> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            include.is_match(rel)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_truncates() {
        let text = "  Line one   has   spaces  \n\n\n  line two  \n";
        assert_eq!(normalize_text(text, 100), "Line one has spaces\nline two");
        assert_eq!(normalize_text(text, 8), "Line one");
    }

    #[test]
    fn document_ids_are_stable_for_identical_content() {
        let meta = DocumentMeta {
            content_hash: Some("abcdef012345".to_string()),
            ..DocumentMeta::default()
        };
        let a = document_id("statutes", &meta);
        let b = document_id("statutes", &meta);
        assert_eq!(a, b);
        assert_eq!(a, "statutes_abcdef0123");
    }

    #[test]
    fn scan_respects_recursion_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "top").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), "nested").unwrap();
        std::fs::write(dir.path().join("c.bin"), "binary").unwrap();

        let include = build_globset(&["**/*.txt".to_string()]).unwrap();
        let all = scan_files(dir.path(), true, &include);
        assert_eq!(all.len(), 2);

        let top = scan_files(dir.path(), false, &include);
        assert_eq!(top.len(), 1);
        assert!(top[0].ends_with("a.txt"));
    }
}
