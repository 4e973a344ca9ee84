//! Text embedding backends and the product/query embedding adapter.
//!
//! Defines the [`TextEmbedder`] trait and two backends:
//! - **`OnnxEmbedder`**: runs a sentence-BERT ONNX export locally with tract
//!   (requires the `onnx` feature).
//! - **[`SagemakerEmbedder`]**: invokes a SageMaker runtime endpoint.
//!
//! [`Embedder`] sits on top of a backend and implements the
//! [`EmbedRawProductDetails`] and [`EmbedRawQueryDetails`] use cases. It
//! lowercases the text, splits batches into `embedding.batch_size` chunks and
//! checks every vector against `embedding.dims`.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to build the backend named by
//! `embedding.provider`:
//!
//! | Config Value | Backend |
//! |-------------|----------|
//! | `"onnx"` | `OnnxEmbedder` |
//! | `"sagemaker"` | [`SagemakerEmbedder`] |

#[cfg(feature = "onnx")]
mod onnx;
mod sagemaker;

#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbedder;
pub use sagemaker::SagemakerEmbedder;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::models::{
    EmbeddedProductDetails, EmbeddedQueryDetails, RawProductDetails, RawQueryDetails,
};
use crate::traits::{EmbedRawProductDetails, EmbedRawQueryDetails};

/// A backend that turns text into vectors.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Short identifier used in logs.
    fn model_name(&self) -> &str;

    /// Embed a batch of texts.
    ///
    /// `Err` means the whole batch failed; `None` entries are per-text
    /// failures. On success the result has one entry per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>>;
}

/// Build the backend selected by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>> {
    match config.provider {
        #[cfg(feature = "onnx")]
        EmbeddingProviderKind::Onnx => Ok(Arc::new(OnnxEmbedder::load(config)?)),
        #[cfg(not(feature = "onnx"))]
        EmbeddingProviderKind::Onnx => {
            anyhow::bail!("Provider 'onnx' requires building with --features onnx")
        }
        EmbeddingProviderKind::Sagemaker => Ok(Arc::new(SagemakerEmbedder::new(config)?)),
    }
}

// ============ Use-case adapter ============

/// Embeds products and queries with any [`TextEmbedder`].
pub struct Embedder {
    backend: Arc<dyn TextEmbedder>,
    dims: usize,
    batch_size: usize,
}

impl Embedder {
    pub fn new(backend: Arc<dyn TextEmbedder>, dims: usize, batch_size: usize) -> Self {
        Self {
            backend,
            dims,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(
            create_embedder(config)?,
            config.dims,
            config.batch_size,
        ))
    }

    /// Embed texts chunk by chunk; output has exactly one entry per input.
    async fn embed_all(&self, texts: Vec<String>) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            match self.backend.embed_texts(chunk).await {
                Ok(vectors) if vectors.len() == chunk.len() => {
                    out.extend(vectors.into_iter().map(|v| self.check_dims(v)));
                }
                Ok(vectors) => {
                    error!(
                        model = self.backend.model_name(),
                        expected = chunk.len(),
                        got = vectors.len(),
                        "Embedding backend returned wrong number of vectors"
                    );
                    out.extend(std::iter::repeat_with(|| None).take(chunk.len()));
                }
                Err(e) => {
                    error!(model = self.backend.model_name(), count = chunk.len(), error = %e, "Embedding batch failed");
                    out.extend(std::iter::repeat_with(|| None).take(chunk.len()));
                }
            }
        }
        out
    }

    fn check_dims(&self, vector: Option<Vec<f32>>) -> Option<Vec<f32>> {
        let vector = vector?;
        if vector.len() != self.dims {
            warn!(expected = self.dims, got = vector.len(), "Embedding dimension mismatch");
            return None;
        }
        Some(vector)
    }
}

#[async_trait]
impl EmbedRawProductDetails for Embedder {
    async fn embed(&self, product: &RawProductDetails) -> Option<EmbeddedProductDetails> {
        self.embed_many(std::slice::from_ref(product))
            .await
            .into_iter()
            .next()
            .flatten()
    }

    async fn embed_many(
        &self,
        products: &[RawProductDetails],
    ) -> Vec<Option<EmbeddedProductDetails>> {
        let texts = products.iter().map(|p| p.name.to_lowercase()).collect();
        let vectors = self.embed_all(texts).await;
        let now = Local::now().naive_local();

        products
            .iter()
            .zip(vectors)
            .map(|(product, vector)| {
                let Some(embedding) = vector else {
                    error!(product_id = %product.product_id, "Error embedding product");
                    return None;
                };
                Some(EmbeddedProductDetails {
                    product_id: product.product_id.clone(),
                    embedding,
                    modified_date: product.modified_date,
                    created_date: now,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EmbedRawQueryDetails for Embedder {
    async fn embed_query(&self, query: &RawQueryDetails) -> Option<EmbeddedQueryDetails> {
        self.embed_queries(std::slice::from_ref(query))
            .await
            .into_iter()
            .next()
            .flatten()
    }

    async fn embed_queries(&self, queries: &[RawQueryDetails]) -> Vec<Option<EmbeddedQueryDetails>> {
        let texts = queries.iter().map(|q| q.query.to_lowercase()).collect();
        let vectors = self.embed_all(texts).await;

        queries
            .iter()
            .zip(vectors)
            .map(|(query, vector)| {
                vector.map(|embedding| EmbeddedQueryDetails {
                    embedding,
                    created_date: query.created_date,
                })
            })
            .collect()
    }
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
