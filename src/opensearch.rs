//! OpenSearch adapter: k-NN index of product embeddings.
//!
//! Documents are keyed by `product_id` and carry the embedding in a
//! `knn_vector` field named `product_embedding`. Writes use external
//! versioning with the microsecond timestamp of `modified_date`, so an
//! older embedding never replaces a newer one. A version conflict (HTTP 409)
//! therefore means "already up to date" and is reported as success.
//!
//! # Scores
//!
//! With the `cosinesimil` space OpenSearch reports `score = (1 + cos) / 2`.
//! Queries translate the caller's cosine threshold into `min_score` and map
//! hit scores back to cosine similarity.
//!
//! # Authentication
//!
//! `basic` uses HTTP basic auth (`username` / `password`, the password may
//! come from `OPENSEARCH_PASSWORD`). `aws_sigv4` signs every request for the
//! `es` service with credentials from the environment.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::aws::{AwsCredentials, RecyclingClient, SigV4Signer};
use crate::config::{Config, OpenSearchAuth, OpenSearchConfig};
use crate::models::{EmbeddedProductDetails, EmbeddedQueryDetails, SimilarProduct, DATE_FORMAT};
use crate::traits::{QuerySimilarProductDetails, UpsertEmbeddedProductDetails};

/// Name of the vector field in the index mapping.
pub const EMBEDDING_FIELD: &str = "product_embedding";

enum Auth {
    Basic {
        username: String,
        password: Option<String>,
    },
    SigV4(SigV4Signer),
    None,
}

pub struct OpenSearchIndex {
    endpoint: String,
    index: String,
    auth: Auth,
    client: RecyclingClient,
    upsert_batch_size: usize,
    default_threshold: f64,
    default_top_k: usize,
    max_workers: usize,
}

impl OpenSearchIndex {
    pub fn new(config: &OpenSearchConfig) -> Result<Self> {
        let auth = match config.auth {
            OpenSearchAuth::Basic => match config.username.clone() {
                Some(username) => Auth::Basic {
                    username,
                    password: config.resolved_password(),
                },
                None => Auth::None,
            },
            OpenSearchAuth::AwsSigv4 => {
                let region = config
                    .region
                    .as_deref()
                    .context("opensearch.region is required for aws_sigv4 auth")?;
                Auth::SigV4(SigV4Signer::new(AwsCredentials::from_env()?, region, "es"))
            }
        };

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            auth,
            client: RecyclingClient::new(Duration::from_secs(config.timeout_secs)),
            upsert_batch_size: config.upsert_batch_size,
            default_threshold: 0.5,
            default_top_k: 10,
            max_workers: 10,
        })
    }

    /// Index with query defaults taken from `[search]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut index = Self::new(&config.opensearch)?;
        index.default_threshold = config.search.default_threshold;
        index.default_top_k = config.search.default_limit;
        index.max_workers = config.search.max_workers;
        Ok(index)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(u16, Value)> {
        let client = self.client.get()?;
        let url = format!("{}{}", self.endpoint, path);

        let resp = match &self.auth {
            Auth::SigV4(signer) => {
                let headers = vec![("content-type".to_string(), content_type.to_string())];
                signer.send(&client, method, &url, &headers, body).await?
            }
            Auth::Basic { username, password } => {
                client
                    .request(method, &url)
                    .basic_auth(username, password.as_deref())
                    .header("content-type", content_type)
                    .body(body)
                    .send()
                    .await?
            }
            Auth::None => {
                client
                    .request(method, &url)
                    .header("content-type", content_type)
                    .body(body)
                    .send()
                    .await?
            }
        };

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, value))
    }

    /// Create the k-NN index unless it already exists.
    pub async fn ensure_index(&self, dims: usize) -> Result<bool> {
        let path = format!("/{}", self.index);
        let (status, _) = self
            .request(Method::HEAD, &path, "application/json", Vec::new())
            .await?;
        if status == 200 {
            return Ok(false);
        }

        let body = serde_json::to_vec(&index_definition(dims))?;
        let (status, resp) = self
            .request(Method::PUT, &path, "application/json", body)
            .await?;
        if !(200..300).contains(&status) {
            bail!("Failed to create OpenSearch index '{}' (HTTP {}): {}", self.index, status, resp);
        }
        info!(index = %self.index, dims, "Created OpenSearch index");
        Ok(true)
    }

    async fn index_document(&self, product: &EmbeddedProductDetails) -> Result<()> {
        let path = format!(
            "/{}/_doc/{}?version={}&version_type=external_gte",
            self.index,
            crate::aws::uri_encode(&product.product_id),
            document_version(product)
        );
        let body = serde_json::to_vec(&document_source(product))?;
        let (status, resp) = self
            .request(Method::PUT, &path, "application/json", body)
            .await?;
        match status {
            200..=299 => Ok(()),
            409 => {
                info!(product_id = %product.product_id, "Newer version of document already exists");
                Ok(())
            }
            _ => bail!("index request failed (HTTP {}): {}", status, resp),
        }
    }

    async fn bulk_index(&self, products: &[EmbeddedProductDetails]) -> Result<Vec<bool>> {
        let body = bulk_body(&self.index, products)?;
        let (status, resp) = self
            .request(Method::POST, "/_bulk", "application/x-ndjson", body.into_bytes())
            .await?;
        if !(200..300).contains(&status) {
            bail!("bulk request failed (HTTP {}): {}", status, resp);
        }
        parse_bulk_response(&resp, products.len())
    }

    async fn search(
        &self,
        query: &EmbeddedQueryDetails,
        threshold: f64,
        top_k: usize,
    ) -> Result<Vec<SimilarProduct>> {
        let path = format!("/{}/_search", self.index);
        let body = serde_json::to_vec(&knn_query(&query.embedding, threshold, top_k))?;
        let (status, resp) = self
            .request(Method::POST, &path, "application/json", body)
            .await?;
        if !(200..300).contains(&status) {
            bail!("search request failed (HTTP {}): {}", status, resp);
        }
        parse_search_hits(&resp)
    }
}

#[async_trait]
impl UpsertEmbeddedProductDetails for OpenSearchIndex {
    async fn upsert(&self, product: &EmbeddedProductDetails) -> bool {
        match self.index_document(product).await {
            Ok(()) => true,
            Err(e) => {
                error!(product_id = %product.product_id, error = %e, "Error upserting document");
                false
            }
        }
    }

    async fn upsert_many(&self, products: &[EmbeddedProductDetails]) -> Vec<bool> {
        let mut successes = Vec::with_capacity(products.len());
        for chunk in products.chunks(self.upsert_batch_size) {
            match self.bulk_index(chunk).await {
                Ok(flags) => {
                    let failed: Vec<&str> = chunk
                        .iter()
                        .zip(&flags)
                        .filter(|(_, ok)| !**ok)
                        .map(|(p, _)| p.product_id.as_str())
                        .collect();
                    if !failed.is_empty() {
                        error!(product_ids = ?failed, "Failed to upsert products to OpenSearch");
                    }
                    successes.extend(flags);
                }
                Err(e) => {
                    let ids: Vec<&str> = chunk.iter().map(|p| p.product_id.as_str()).collect();
                    error!(product_ids = ?ids, error = %e, "Failed to upsert batch to OpenSearch");
                    successes.extend(std::iter::repeat(false).take(chunk.len()));
                }
            }
        }
        successes
    }

    async fn close(&self) -> bool {
        self.client.reset();
        true
    }
}

#[async_trait]
impl QuerySimilarProductDetails for OpenSearchIndex {
    async fn query(
        &self,
        query: &EmbeddedQueryDetails,
        threshold: Option<f64>,
        top_k: Option<usize>,
    ) -> Option<Vec<SimilarProduct>> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let top_k = top_k.unwrap_or(self.default_top_k);
        match self.search(query, threshold, top_k).await {
            Ok(hits) => {
                debug!(hits = hits.len(), threshold, top_k, "OpenSearch k-NN query");
                Some(hits)
            }
            Err(e) => {
                error!(error = %e, "Error querying similar products from OpenSearch");
                None
            }
        }
    }

    async fn query_many(
        &self,
        queries: &[EmbeddedQueryDetails],
        threshold: Option<f64>,
        top_k: Option<usize>,
    ) -> Vec<Option<Vec<SimilarProduct>>> {
        let calls: Vec<_> = queries
            .iter()
            .map(|q| self.query(q, threshold, top_k))
            .collect();
        stream::iter(calls)
            .buffered(self.max_workers)
            .collect()
            .await
    }

    async fn close(&self) -> bool {
        self.client.reset();
        true
    }
}

// ============ Request / response shapes ============

/// External version for a document: `modified_date` in microseconds.
fn document_version(product: &EmbeddedProductDetails) -> i64 {
    product.modified_date.and_utc().timestamp_micros()
}

fn document_source(product: &EmbeddedProductDetails) -> Value {
    json!({
        "product_id": product.product_id,
        EMBEDDING_FIELD: product.embedding,
        "modified_date": product.modified_date.format(DATE_FORMAT).to_string(),
        "created_date": product.created_date.format(DATE_FORMAT).to_string(),
    })
}

/// NDJSON body for `POST /_bulk`: one action line and one source line per product.
fn bulk_body(index: &str, products: &[EmbeddedProductDetails]) -> Result<String> {
    let mut body = String::new();
    for product in products {
        let action = json!({
            "index": {
                "_index": index,
                "_id": product.product_id,
                "version": document_version(product),
                "version_type": "external_gte",
            }
        });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&document_source(product))?);
        body.push('\n');
    }
    Ok(body)
}

/// Per-item outcome of a bulk response, in request order. 409 counts as success.
fn parse_bulk_response(resp: &Value, expected: usize) -> Result<Vec<bool>> {
    let items = resp
        .get("items")
        .and_then(Value::as_array)
        .context("bulk response has no items")?;
    if items.len() != expected {
        bail!("bulk response has {} items, expected {}", items.len(), expected);
    }

    Ok(items
        .iter()
        .map(|item| {
            let Some(op) = item.get("index") else {
                return false;
            };
            let status = op.get("status").and_then(Value::as_u64).unwrap_or(0);
            match status {
                200..=299 => true,
                409 => {
                    debug!(id = ?op.get("_id"), "Newer version of document already exists");
                    true
                }
                _ => {
                    let err = op.get("error");
                    error!(
                        id = ?op.get("_id"),
                        status,
                        error_type = ?err.and_then(|e| e.get("type")),
                        reason = ?err.and_then(|e| e.get("reason")),
                        "Bulk index item failed"
                    );
                    false
                }
            }
        })
        .collect())
}

/// k-NN search body; `min_score` is the cosine threshold in OpenSearch score space.
fn knn_query(embedding: &[f32], threshold: f64, top_k: usize) -> Value {
    json!({
        "size": top_k,
        "query": {
            "knn": {
                EMBEDDING_FIELD: {
                    "vector": embedding,
                    "k": top_k,
                }
            }
        },
        "min_score": (1.0 + threshold) / 2.0,
        "_source": ["product_id"],
    })
}

fn parse_search_hits(resp: &Value) -> Result<Vec<SimilarProduct>> {
    let hits = resp
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .context("search response has no hits")?;

    hits.iter()
        .map(|hit| {
            let product_id = hit
                .pointer("/_source/product_id")
                .and_then(Value::as_str)
                .context("hit without product_id")?;
            let score = hit
                .get("_score")
                .and_then(Value::as_f64)
                .context("hit without _score")?;
            Ok(SimilarProduct {
                product_id: product_id.to_string(),
                score: 2.0 * score - 1.0,
            })
        })
        .collect()
}

/// Settings and mappings for the product index.
fn index_definition(dims: usize) -> Value {
    json!({
        "settings": {
            "index": { "knn": true }
        },
        "mappings": {
            "properties": {
                "product_id": { "type": "keyword" },
                EMBEDDING_FIELD: {
                    "type": "knn_vector",
                    "dimension": dims,
                    "method": {
                        "name": "hnsw",
                        "space_type": "cosinesimil",
                        "engine": "lucene"
                    }
                },
                "modified_date": { "type": "date", "format": "yyyy-MM-dd HH:mm:ss" },
                "created_date": { "type": "date", "format": "yyyy-MM-dd HH:mm:ss" }
            }
        }
    })
}
