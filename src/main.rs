//! # lexrag CLI
//!
//! The `lexrag` binary drives the legal research pipeline: document
//! ingestion, vector search, research queries, web search, collection
//! administration, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! lexrag --config ./config/lexrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lexrag ingest <dir> --collection <name>` | Process documents into a collection |
//! | `lexrag search "<query>"` | Vector search across collections |
//! | `lexrag research "<question>"` | Full research query with synthesis |
//! | `lexrag websearch "<query>"` | Search authorized web sources and ingest |
//! | `lexrag sync [collection]` | Force a flush to the durable store |
//! | `lexrag purge <collection> --yes` | Destroy a collection's documents |
//! | `lexrag stats` | Per-collection document counts |
//! | `lexrag serve` | Start the HTTP API server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lexrag::config;
use lexrag::embedding::EmbedInput;
use lexrag::engine::SearchFilters;
use lexrag::research::{ResearchRequest, Services};
use lexrag::server;

/// lexrag — a retrieval-augmented legal research pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Credentials (embedding/chat API keys, AWS keys, search API key)
/// are read from the environment.
#[derive(Parser)]
#[command(
    name = "lexrag",
    about = "lexrag — a retrieval-augmented legal research pipeline",
    version,
    long_about = "lexrag ingests legal documents into vector collections backed by a durable \
    object store, searches them semantically, supplements thin results from authorized web \
    sources, and synthesizes cited answers with a chat model."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lexrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Process documents from a directory into a collection.
    ///
    /// Extracts text, derives metadata, embeds through the cache, verifies
    /// quality, and flushes the collection to the durable store. Failures
    /// are reported per document; one bad file never aborts the batch.
    Ingest {
        /// Directory containing documents (txt, html, json, pdf, docx).
        dir: PathBuf,

        /// Destination collection: case_law, statutes, or regulations.
        #[arg(long)]
        collection: String,

        /// Documents per batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Recurse into subdirectories.
        #[arg(long)]
        recursive: bool,
    },

    /// Semantic search across collections.
    Search {
        /// The search query.
        query: String,

        /// Collections to search (repeatable). All of them by default.
        #[arg(long = "collection")]
        collections: Vec<String>,

        /// Maximum results.
        #[arg(long)]
        limit: Option<usize>,

        /// Only documents dated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },

    /// Run a full research query: search, optional web supplementation,
    /// and synthesized answer with source citations.
    Research {
        /// The legal question.
        query: String,

        /// Skip web search even when vector coverage is thin.
        #[arg(long)]
        no_web: bool,

        /// Maximum web results to process.
        #[arg(long, default_value_t = 5)]
        max_web_results: usize,
    },

    /// Search authorized web sources and ingest what classifies as legal
    /// material.
    Websearch {
        /// The search query.
        query: String,

        /// Pin results to this collection instead of classifying.
        #[arg(long)]
        collection: Option<String>,

        /// Maximum search results to process.
        #[arg(long, default_value_t = 5)]
        max_results: usize,

        /// Follow links on fetched pages (depth-bounded).
        #[arg(long)]
        follow_links: bool,
    },

    /// Force an immediate flush to the durable store.
    ///
    /// With a collection name, that collection is written out whether
    /// dirty or not; without, every dirty collection is flushed.
    Sync {
        /// Collection to flush.
        collection: Option<String>,
    },

    /// Remove every document in a collection, from the index and the
    /// durable store. This is the only way documents are destroyed.
    Purge {
        /// Collection to purge.
        collection: String,

        /// Required confirmation flag.
        #[arg(long)]
        yes: bool,
    },

    /// Show per-collection document counts.
    Stats,

    /// Start the HTTP API server.
    ///
    /// Hydrates collections from the durable store, starts the background
    /// synchronizer, and serves the research API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest {
            dir,
            collection,
            batch_size,
            recursive,
        } => {
            let services = Services::init(&cfg).await?;
            let batch = batch_size.unwrap_or(cfg.pipeline.batch_size);
            let stats = services
                .pipeline
                .process_documents(&dir, &collection, batch, recursive)
                .await?;

            println!("ingest {} -> {}", dir.display(), collection);
            println!("  processed: {}", stats.processed);
            println!("  succeeded: {}", stats.succeeded);
            println!("  failed: {}", stats.failed);
            println!("  skipped: {}", stats.skipped);
            for error in &stats.errors {
                println!("  {}: {}", error.source, error.error);
            }
        }
        Commands::Search {
            query,
            collections,
            limit,
            since,
        } => {
            let services = Services::init(&cfg).await?;
            let vector = services
                .cache
                .get_or_compute(&query, EmbedInput::Query)
                .await?;

            let names = if collections.is_empty() {
                services.engine.collection_names().await
            } else {
                collections
            };
            let filters = SearchFilters {
                since: since
                    .map(|s| {
                        chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                            .map_err(|e| anyhow::anyhow!("invalid --since date: {}", e))
                    })
                    .transpose()?,
                ..SearchFilters::default()
            };
            let hits = services
                .engine
                .search(&vector, &names, limit.unwrap_or(cfg.retrieval.top_k), &filters)
                .await;

            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                let doc = &hit.document;
                let title = doc
                    .meta
                    .title
                    .as_deref()
                    .or(doc.meta.case_name.as_deref())
                    .unwrap_or("(untitled)");
                println!("{}. [{:.3}] {} / {}", i + 1, hit.score, doc.collection, title);
                if let Some(ref url) = doc.meta.source_url {
                    println!("    url: {}", url);
                }
                let excerpt: String = doc.text.chars().take(160).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
                println!("    id: {}", doc.id);
                println!();
            }
        }
        Commands::Research {
            query,
            no_web,
            max_web_results,
        } => {
            let services = Services::init(&cfg).await?;
            let request = ResearchRequest {
                query,
                collections: None,
                use_web_search: !no_web,
                max_web_results,
                conversation_id: None,
            };
            let result = services.agent.query(request).await?;

            println!("{}", result.synthesis);
            println!();
            if result.is_partial {
                println!("[partial result: degraded upstream availability or missing sections]");
            }
            if !result.sources.is_empty() {
                println!("Sources:");
                for source in &result.sources {
                    match &source.url {
                        Some(url) => println!("  - {} ({})", source.title, url),
                        None => println!("  - {} [{}]", source.title, source.source),
                    }
                }
            }
        }
        Commands::Websearch {
            query,
            collection,
            max_results,
            follow_links,
        } => {
            let services = Services::init(&cfg).await?;
            let websearch = services
                .websearch
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("web search is disabled in the configuration"))?;

            let (documents, stats) = websearch
                .search_and_process(&query, collection.as_deref(), max_results, follow_links)
                .await?;
            services.engine.sync(None).await?;

            println!("websearch \"{}\"", query);
            println!("  urls found: {}", stats.urls_found);
            println!("  urls authorized: {}", stats.urls_authorized);
            println!("  pages fetched: {}", stats.pages_fetched);
            println!("  pages failed: {}", stats.pages_failed);
            println!("  documents processed: {}", stats.documents_processed);
            if stats.fallback_used {
                println!("  (built-in fallback documents were used)");
            }
            for doc in &documents {
                println!("  -> {} [{}]", doc.id, doc.collection);
            }
        }
        Commands::Sync { collection } => {
            let services = Services::init(&cfg).await?;
            let flushed = services.engine.sync(collection.as_deref()).await?;
            if flushed.is_empty() {
                println!("nothing to flush");
            } else {
                for name in flushed {
                    println!("flushed {}", name);
                }
            }
            println!("ok");
        }
        Commands::Purge { collection, yes } => {
            if !yes {
                anyhow::bail!("purge is destructive; re-run with --yes to confirm");
            }
            let services = Services::init(&cfg).await?;
            let removed = services.engine.purge(&collection).await?;
            println!("purged {} documents from {}", removed, collection);
        }
        Commands::Stats => {
            let services = Services::init(&cfg).await?;
            let stats = services.engine.stats().await;
            for (name, counts) in stats {
                println!(
                    "{}: {} documents ({} embedded)",
                    name, counts.documents, counts.embedded
                );
            }
        }
        Commands::Serve => {
            let services = Services::init(&cfg).await?;
            server::run_server(&cfg, services).await?;
        }
    }

    Ok(())
}
