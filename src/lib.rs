//! # Knowledge Harness
//!
//! Keeps a vector index in step with a two-root knowledge base (`internal`
//! and `external`) and answers questions from it with citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────────────────┐   ┌──────────┐
//! │  Watcher +  │──▶│ Durable  │──▶│ Workers: extract/OCR │──▶│  SQLite  │
//! │ reconcile   │   │  queue   │   │  → chunk → embed     │   │ vectors  │
//! └─────────────┘   └──────────┘   └──────────────────────┘   └────┬─────┘
//!                                                                  │
//!                            ┌─────────────────────────────────────┤
//!                            ▼                                     ▼
//!                       ┌──────────┐                         ┌──────────┐
//!                       │   CLI    │                         │   HTTP   │
//!                       │  (kh)    │                         │  server  │
//!                       └──────────┘                         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kh init                                   # create database
//! kh reconcile --wait                       # index everything now
//! kh ask "What was the annual revenue?"
//! kh serve                                  # watch roots and serve HTTP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`connector_fs`] | Knowledge root scanning and document ids |
//! | [`watcher`] | Reconciliation, change feed, debouncing |
//! | [`extract`] | Format detection and text extraction |
//! | [`ocr`] | OCR fallback engine |
//! | [`chunk`] | Text normalization and chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Versioned vector index |
//! | [`queue`] | Durable job queue |
//! | [`worker`] | Indexing worker pool |
//! | [`generation`] | Answer generation backends |
//! | [`answer`] | Retrieval and answer composition |
//! | [`status`] | Ingestion status and re-index trigger |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod queue;
pub mod server;
pub mod status;
pub mod watcher;
pub mod worker;
