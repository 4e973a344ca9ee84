//! Use-case traits implemented by every storage, queue and model adapter.
//!
//! The pipelines in [`crate::pipeline`], [`crate::ingest`] and
//! [`crate::search`] only ever hold `Arc<dyn Trait>` objects, so each
//! external system can be swapped out (or faked in tests).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐     ┌───────────────────────────────┐
//! │ FetchRawProductDetails    │◀────│ PostgresProductStore          │
//! │ UpsertRawProductDetails   │◀────│ PostgresProductStore, SqsQueue│
//! │ UpsertEmbeddedProduct..   │◀────│ PostgresProductStore,         │
//! │                           │     │ OpenSearchIndex               │
//! │ QuerySimilarProduct..     │◀────│ OpenSearchIndex,              │
//! │                           │     │ PostgresProductStore          │
//! │ EmbedRawProductDetails    │◀────│ Embedder (ONNX / SageMaker)   │
//! │ EmbedRawQueryDetails      │◀────│ Embedder (ONNX / SageMaker)   │
//! └───────────────────────────┘     └───────────────────────────────┘
//! ```
//!
//! # Contract
//!
//! Every trait has a single-item and a batch form:
//!
//! - A per-item failure is reported as `None` / `false` for that entry.
//! - A system failure (connection lost, HTTP error, timeout) is logged and
//!   swallowed; the affected items are reported as failed. Methods never
//!   return `Err`.
//! - Batch results have exactly the input length, in input order.
//!
//! Adapters chunk batch input into fixed-size groups. A failing group marks
//! all of its items failed and processing continues with the next group.

use async_trait::async_trait;

use crate::models::{
    EmbeddedProductDetails, EmbeddedQueryDetails, RawProductDetails, RawQueryDetails,
    SimilarProduct,
};

// ═══════════════════════════════════════════════════════════════════════
// Raw products
// ═══════════════════════════════════════════════════════════════════════

/// Look up raw products by id.
#[async_trait]
pub trait FetchRawProductDetails: Send + Sync {
    /// Fetch one product. `None` when it does not exist or the fetch failed.
    async fn fetch(&self, product_id: &str) -> Option<RawProductDetails>;

    /// Fetch many products. Missing or failed ids map to `None`.
    async fn fetch_many(&self, product_ids: &[String]) -> Vec<Option<RawProductDetails>>;

    /// Release held resources. Returns `false` if closing failed.
    async fn close(&self) -> bool {
        true
    }
}

/// Persist or publish raw products.
#[async_trait]
pub trait UpsertRawProductDetails: Send + Sync {
    async fn upsert(&self, product: &RawProductDetails) -> bool;

    async fn upsert_many(&self, products: &[RawProductDetails]) -> Vec<bool>;

    async fn close(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Embedding
// ═══════════════════════════════════════════════════════════════════════

/// Turn raw products into vectors.
///
/// Implementations embed the lowercased product `name`, copy `product_id`
/// and `modified_date` from the input, and stamp `created_date` with the
/// embedding time.
#[async_trait]
pub trait EmbedRawProductDetails: Send + Sync {
    async fn embed(&self, product: &RawProductDetails) -> Option<EmbeddedProductDetails>;

    async fn embed_many(&self, products: &[RawProductDetails])
        -> Vec<Option<EmbeddedProductDetails>>;

    async fn close(&self) -> bool {
        true
    }
}

/// Turn search queries into vectors.
#[async_trait]
pub trait EmbedRawQueryDetails: Send + Sync {
    async fn embed_query(&self, query: &RawQueryDetails) -> Option<EmbeddedQueryDetails>;

    async fn embed_queries(&self, queries: &[RawQueryDetails]) -> Vec<Option<EmbeddedQueryDetails>>;

    async fn close(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Vectors
// ═══════════════════════════════════════════════════════════════════════

/// Persist product vectors. Writes are conditional on `modified_date`: an
/// older version never overwrites a newer one, and such a skipped write
/// still counts as success.
#[async_trait]
pub trait UpsertEmbeddedProductDetails: Send + Sync {
    async fn upsert(&self, product: &EmbeddedProductDetails) -> bool;

    async fn upsert_many(&self, products: &[EmbeddedProductDetails]) -> Vec<bool>;

    async fn close(&self) -> bool {
        true
    }
}

/// Nearest-neighbour lookup over product vectors.
///
/// `threshold` is a minimum cosine similarity in `[-1, 1]` and `top_k` the
/// maximum number of hits; `None` falls back to the adapter's defaults.
/// Hits are ordered by descending score.
#[async_trait]
pub trait QuerySimilarProductDetails: Send + Sync {
    async fn query(
        &self,
        query: &EmbeddedQueryDetails,
        threshold: Option<f64>,
        top_k: Option<usize>,
    ) -> Option<Vec<SimilarProduct>>;

    async fn query_many(
        &self,
        queries: &[EmbeddedQueryDetails],
        threshold: Option<f64>,
        top_k: Option<usize>,
    ) -> Vec<Option<Vec<SimilarProduct>>>;

    async fn close(&self) -> bool {
        true
    }
}
