//! # lexrag
//!
//! A retrieval-augmented legal research pipeline: free-text legal questions
//! in, cited synthesized answers out.
//!
//! The pipeline combines cached embeddings, multi-collection vector search
//! with durable cloud-backed persistence, allow-listed web search with
//! document classification, and chat-model synthesis — while tolerating
//! unreliable upstream services at every seam.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌─────────────┐
//! │  Sources  │──▶│  Pipeline   │──▶│  Collections │◀──▶ durable store
//! │ files/web │   │ extract+    │   │  (vector     │     (S3)
//! └───────────┘   │ embed+check │   │   search)    │
//!                 └────────────┘   └──────┬──────┘
//!                                         │
//!                  ┌──────────────────────┤
//!                  ▼                      ▼
//!            ┌───────────┐         ┌───────────┐
//!            │ Synthesis │◀───────▶│   HTTP /  │
//!            │ + memory  │         │    CLI    │
//!            └───────────┘         └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`backoff`] | Retry policy for upstream calls |
//! | [`cache`] | Embedding/result cache with in-process fallback |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`chat`] | Chat/synthesis provider abstraction |
//! | [`object_store`] | Durable collection storage (S3) |
//! | [`engine`] | Multi-collection vector search |
//! | [`extract`] | Multi-format text extraction |
//! | [`metadata`] | Legal metadata extraction and classification |
//! | [`pipeline`] | Document ingestion pipeline |
//! | [`websearch`] | Authorized-domain web search |
//! | [`synthesis`] | Research synthesis chain |
//! | [`memory`] | Conversation memory |
//! | [`research`] | Query orchestration and service wiring |
//! | [`server`] | HTTP API |

pub mod backoff;
pub mod cache;
pub mod chat;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod memory;
pub mod metadata;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod research;
pub mod server;
pub mod synthesis;
pub mod websearch;
