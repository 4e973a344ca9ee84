//! # Product Search
//!
//! Product catalogue ingestion, embedding and similarity search over
//! Postgres (pgvector), OpenSearch and SQS.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ CSV (file / │──▶│  Ingestion  │──▶│ Postgres │ raw products
//! │    S3)      │   │  pipeline   │──▶│   SQS    │ {product_id, modified_date}
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │
//!                                          ▼
//!                   ┌──────────────────────────────┐
//!                   │ Worker → embedding pipeline  │
//!                   │ fetch → embed (ONNX/SageMaker)│
//!                   └──────┬───────────────┬───────┘
//!                          ▼               ▼
//!                   ┌────────────┐   ┌────────────┐
//!                   │  Postgres  │   │ OpenSearch │ vectors
//!                   └─────┬──────┘   └─────┬──────┘
//!                         └──────┬─────────┘
//!                                ▼
//!                      ┌──────────────────┐
//!                      │ CLI / HTTP API   │ similar products
//!                      └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! psearch init                              # tables, pgvector, k-NN index
//! psearch ingest ./data/products.csv        # raw products → Postgres + SQS
//! psearch worker                            # embed queued products
//! psearch query "stainless steel kettle"
//! psearch serve                             # POST /api/similar_products
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`traits`] | Use-case traits implemented by every adapter |
//! | [`aws`] | SigV4 signing, recycling HTTP client, S3 download |
//! | [`db`] | Postgres connection pool |
//! | [`postgres`] | Raw and embedded product store (pgvector) |
//! | [`opensearch`] | k-NN vector index |
//! | [`sqs`] | Embedding queue |
//! | [`embedding`] | ONNX and SageMaker embedding backends |
//! | [`ingest`] | CSV ingestion pipeline |
//! | [`pipeline`] | Embedding pipeline |
//! | [`worker`] | SQS consumer |
//! | [`search`] | Similar-products use case |
//! | [`server`] | HTTP API |
//! | [`migrate`] | Schema and index bootstrap |

pub mod aws;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod opensearch;
pub mod pipeline;
pub mod postgres;
pub mod search;
pub mod server;
pub mod sqs;
pub mod traits;
pub mod worker;
