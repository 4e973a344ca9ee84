//! Similar-products search: embed query → nearest neighbours → raw details.
//!
//! Shared by `psearch query` and `POST /api/similar_products`. The vector
//! backend is chosen by `search.backend`; product details always come from
//! Postgres.

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::{Config, SearchBackend};
use crate::db;
use crate::embedding::Embedder;
use crate::models::{date_format, RawProductDetails, RawQueryDetails};
use crate::opensearch::OpenSearchIndex;
use crate::postgres::PostgresProductStore;
use crate::traits::{EmbedRawQueryDetails, FetchRawProductDetails, QuerySimilarProductDetails};

/// A product in the response: every raw field plus its similarity score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarProductDetails {
    #[serde(flatten)]
    pub product: RawProductDetails,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarProductsResponse {
    pub similar_products: Vec<SimilarProductDetails>,
    pub query: String,
    #[serde(with = "date_format")]
    pub created_date: NaiveDateTime,
    #[serde(with = "date_format")]
    pub modified_date: NaiveDateTime,
}

/// Which stage of the search failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchError {
    QueryEmbeddingFailed,
    QuerySimilarProductsFailed,
    FetchSimilarProductsFailed,
}

impl SearchError {
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::QueryEmbeddingFailed => "QUERY_EMBEDDING_FAILED",
            SearchError::QuerySimilarProductsFailed => "QUERY_SIMILAR_PRODUCTS_FAILED",
            SearchError::FetchSimilarProductsFailed => "FETCH_SIMILAR_PRODUCTS_FAILED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            SearchError::QueryEmbeddingFailed => "Query Embedding failed",
            SearchError::QuerySimilarProductsFailed => "Query Similar Products failed",
            SearchError::FetchSimilarProductsFailed => "Fetch Similar Products failed",
        }
    }
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for SearchError {}

pub struct SearchService {
    embedder: Arc<dyn EmbedRawQueryDetails>,
    similar: Arc<dyn QuerySimilarProductDetails>,
    fetcher: Arc<dyn FetchRawProductDetails>,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn EmbedRawQueryDetails>,
        similar: Arc<dyn QuerySimilarProductDetails>,
        fetcher: Arc<dyn FetchRawProductDetails>,
    ) -> Self {
        Self {
            embedder,
            similar,
            fetcher,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(&config.postgres)?;
        let store = Arc::new(PostgresProductStore::from_config(pool, config));
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let similar: Arc<dyn QuerySimilarProductDetails> = match config.search.backend {
            SearchBackend::Opensearch => Arc::new(OpenSearchIndex::from_config(config)?),
            SearchBackend::Postgres => store.clone(),
        };
        Ok(Self::new(embedder, similar, store))
    }

    /// Find products similar to `query`.
    ///
    /// `threshold` and `limit` fall back to the `[search]` defaults when
    /// `None`. Hits whose details can no longer be fetched are dropped.
    pub async fn similar_products(
        &self,
        query: &str,
        threshold: Option<f64>,
        limit: Option<usize>,
    ) -> Result<SimilarProductsResponse, SearchError> {
        let created_date = Local::now().naive_local();
        let mut response = SimilarProductsResponse {
            similar_products: Vec::new(),
            query: query.to_string(),
            created_date,
            modified_date: created_date,
        };
        if limit == Some(0) {
            return Ok(response);
        }

        let raw = RawQueryDetails {
            query: query.to_string(),
            created_date,
        };
        let embedded = self.embedder.embed_query(&raw).await.ok_or_else(|| {
            error!(query, "Failed to embed query");
            SearchError::QueryEmbeddingFailed
        })?;

        let hits = self
            .similar
            .query(&embedded, threshold, limit)
            .await
            .ok_or_else(|| {
                error!(query, "Failed to query similar products");
                SearchError::QuerySimilarProductsFailed
            })?;
        debug!(query, hits = hits.len(), "Similar products found");
        if hits.is_empty() {
            response.modified_date = Local::now().naive_local();
            return Ok(response);
        }

        let ids: Vec<String> = hits.iter().map(|h| h.product_id.clone()).collect();
        let details = self.fetcher.fetch_many(&ids).await;
        if details.len() != hits.len() {
            error!(query, hits = hits.len(), "Failed to fetch similar products");
            return Err(SearchError::FetchSimilarProductsFailed);
        }

        response.similar_products = hits
            .into_iter()
            .zip(details)
            .filter_map(|(hit, product)| match product {
                Some(product) => Some(SimilarProductDetails {
                    product,
                    score: hit.score.clamp(-1.0, 1.0),
                }),
                None => {
                    warn!(product_id = %hit.product_id, "Similar product no longer exists");
                    None
                }
            })
            .collect();
        response.modified_date = Local::now().naive_local();
        Ok(response)
    }

    pub async fn close(&self) {
        self.embedder.close().await;
        self.similar.close().await;
        self.fetcher.close().await;
    }
}

/// `psearch query`: print the products most similar to `query`.
pub async fn run_query(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if let Some(t) = threshold {
        if !(-1.0..=1.0).contains(&t) {
            anyhow::bail!("--threshold must be between -1 and 1, got {}", t);
        }
    }

    let service = SearchService::from_config(config)?;
    let result = service.similar_products(query, threshold, limit).await;
    service.close().await;
    let response = result?;

    if response.similar_products.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, item) in response.similar_products.iter().enumerate() {
        let p = &item.product;
        println!("{}. [{:.3}] {} / {}", i + 1, item.score, p.product_id, p.name);
        println!("    category: {} / {}", p.main_category, p.sub_category);
        println!(
            "    price: {:.2} (list {:.2})",
            p.discount_price, p.actual_price
        );
        println!("    ratings: {}", p.ratings);
        if !p.image_url.is_empty() {
            println!("    image: {}", p.image_url);
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddedQueryDetails, SimilarProduct};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct FakeEmbedder {
        ok: bool,
    }

    #[async_trait]
    impl EmbedRawQueryDetails for FakeEmbedder {
        async fn embed_query(&self, query: &RawQueryDetails) -> Option<EmbeddedQueryDetails> {
            self.ok.then(|| EmbeddedQueryDetails {
                embedding: vec![0.0, 1.0],
                created_date: query.created_date,
            })
        }

        async fn embed_queries(&self, queries: &[RawQueryDetails]) -> Vec<Option<EmbeddedQueryDetails>> {
            let mut out = Vec::new();
            for q in queries {
                out.push(self.embed_query(q).await);
            }
            out
        }
    }

    struct FakeIndex {
        hits: Option<Vec<SimilarProduct>>,
        seen: Mutex<Vec<(Option<f64>, Option<usize>)>>,
    }

    #[async_trait]
    impl QuerySimilarProductDetails for FakeIndex {
        async fn query(
            &self,
            _query: &EmbeddedQueryDetails,
            threshold: Option<f64>,
            top_k: Option<usize>,
        ) -> Option<Vec<SimilarProduct>> {
            self.seen.lock().unwrap().push((threshold, top_k));
            self.hits.clone()
        }

        async fn query_many(
            &self,
            queries: &[EmbeddedQueryDetails],
            threshold: Option<f64>,
            top_k: Option<usize>,
        ) -> Vec<Option<Vec<SimilarProduct>>> {
            let mut out = Vec::new();
            for q in queries {
                out.push(self.query(q, threshold, top_k).await);
            }
            out
        }
    }

    /// Knows products "a" and "c". A broken catalogue returns nothing.
    struct FakeCatalogue {
        broken: bool,
    }

    #[async_trait]
    impl FetchRawProductDetails for FakeCatalogue {
        async fn fetch(&self, product_id: &str) -> Option<RawProductDetails> {
            if product_id != "a" && product_id != "c" {
                return None;
            }
            let date = NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap();
            Some(RawProductDetails {
                product_id: product_id.to_string(),
                name: format!("item {}", product_id),
                main_category: "m".to_string(),
                sub_category: "s".to_string(),
                image_url: String::new(),
                ratings: 4.0,
                discount_price: 1.5,
                actual_price: 2.5,
                modified_date: date,
                created_date: date,
            })
        }

        async fn fetch_many(&self, ids: &[String]) -> Vec<Option<RawProductDetails>> {
            let mut out = Vec::new();
            if self.broken {
                return out;
            }
            for id in ids {
                out.push(self.fetch(id).await);
            }
            out
        }
    }

    fn hit(id: &str, score: f64) -> SimilarProduct {
        SimilarProduct {
            product_id: id.to_string(),
            score,
        }
    }

    fn service(embed_ok: bool, hits: Option<Vec<SimilarProduct>>) -> (SearchService, Arc<FakeIndex>) {
        service_with_catalogue(embed_ok, hits, false)
    }

    fn service_with_catalogue(
        embed_ok: bool,
        hits: Option<Vec<SimilarProduct>>,
        broken_catalogue: bool,
    ) -> (SearchService, Arc<FakeIndex>) {
        let index = Arc::new(FakeIndex {
            hits,
            seen: Mutex::new(Vec::new()),
        });
        let svc = SearchService::new(
            Arc::new(FakeEmbedder { ok: embed_ok }),
            index.clone(),
            Arc::new(FakeCatalogue {
                broken: broken_catalogue,
            }),
        );
        (svc, index)
    }

    #[tokio::test]
    async fn test_drops_missing_products_and_keeps_scores_aligned() {
        let (svc, index) = service(
            true,
            Some(vec![hit("a", 1.2), hit("b", 0.8), hit("c", 0.5)]),
        );
        let resp = svc.similar_products("Kettle", Some(0.3), Some(3)).await.unwrap();
        assert_eq!(resp.query, "Kettle");
        let got: Vec<(&str, f64)> = resp
            .similar_products
            .iter()
            .map(|p| (p.product.product_id.as_str(), p.score))
            .collect();
        assert_eq!(got, vec![("a", 1.0), ("c", 0.5)]);
        assert_eq!(*index.seen.lock().unwrap(), vec![(Some(0.3), Some(3))]);
    }

    #[tokio::test]
    async fn test_stage_failures() {
        let (svc, _) = service(false, Some(vec![]));
        assert_eq!(
            svc.similar_products("x", None, None).await.unwrap_err(),
            SearchError::QueryEmbeddingFailed
        );

        let (svc, _) = service(true, None);
        assert_eq!(
            svc.similar_products("x", None, None).await.unwrap_err(),
            SearchError::QuerySimilarProductsFailed
        );

        let (svc, _) = service_with_catalogue(true, Some(vec![hit("a", 0.9)]), true);
        let err = svc.similar_products("x", None, None).await.unwrap_err();
        assert_eq!(err, SearchError::FetchSimilarProductsFailed);
        assert_eq!(err.code(), "FETCH_SIMILAR_PRODUCTS_FAILED");
    }

    #[tokio::test]
    async fn test_all_hits_missing_from_catalogue_is_empty_success() {
        let (svc, _) = service(true, Some(vec![hit("b", 0.9), hit("d", 0.7)]));
        let resp = svc.similar_products("x", None, None).await.unwrap();
        assert!(resp.similar_products.is_empty());
    }

    #[tokio::test]
    async fn test_no_hits_is_empty_success() {
        let (svc, _) = service(true, Some(vec![]));
        let resp = svc.similar_products("x", None, None).await.unwrap();
        assert!(resp.similar_products.is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_skips_backends() {
        let (svc, index) = service(true, Some(vec![hit("a", 0.9)]));
        let resp = svc.similar_products("x", None, Some(0)).await.unwrap();
        assert!(resp.similar_products.is_empty());
        assert!(index.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_response_serialization_flattens_product() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let resp = SimilarProductsResponse {
            similar_products: vec![SimilarProductDetails {
                product: RawProductDetails {
                    product_id: "a".to_string(),
                    name: "n".to_string(),
                    main_category: "m".to_string(),
                    sub_category: "s".to_string(),
                    image_url: "u".to_string(),
                    ratings: 4.0,
                    discount_price: 1.5,
                    actual_price: 2.5,
                    modified_date: date,
                    created_date: date,
                },
                score: 0.25,
            }],
            query: "q".to_string(),
            created_date: date,
            modified_date: date,
        };
        let v = serde_json::to_value(&resp).unwrap();
        let p = &v["similar_products"][0];
        assert_eq!(p["product_id"], "a");
        assert_eq!(p["score"], 0.25);
        assert_eq!(p["modified_date"], "2024-01-02 03:04:05");
        assert_eq!(v["created_date"], "2024-01-02 03:04:05");
    }
}
