//! Embedding pipeline: fetch → staleness check → embed → upsert to every
//! vector store.
//!
//! A product succeeds only if every stage succeeds for it. Results are
//! reported per input message, in input order, so the queue worker can
//! delete exactly the messages that were processed.
//!
//! ```text
//! ProductMessage ──▶ fetch raw ──▶ raw.modified_date <= msg.modified_date ?
//!                                        │
//!                                        ▼
//!                                 embed (lowercased name)
//!                                        │
//!                        ┌───────────────┴───────────────┐
//!                        ▼                               ▼
//!                 Postgres (pgvector)               OpenSearch
//! ```
//!
//! A message older than the stored product is treated as a failure: the
//! newer message for the same product is still on its way.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::models::{parse_date, EmbeddedProductDetails, ProductMessage, RawProductDetails};
use crate::opensearch::OpenSearchIndex;
use crate::postgres::PostgresProductStore;
use crate::traits::{EmbedRawProductDetails, FetchRawProductDetails, UpsertEmbeddedProductDetails};

pub struct EmbeddingPipeline {
    fetcher: Arc<dyn FetchRawProductDetails>,
    embedder: Arc<dyn EmbedRawProductDetails>,
    stores: Vec<Arc<dyn UpsertEmbeddedProductDetails>>,
}

impl EmbeddingPipeline {
    pub fn new(
        fetcher: Arc<dyn FetchRawProductDetails>,
        embedder: Arc<dyn EmbedRawProductDetails>,
        stores: Vec<Arc<dyn UpsertEmbeddedProductDetails>>,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            stores,
        }
    }

    /// Wire Postgres, the configured embedding backend and OpenSearch.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(&config.postgres)?;
        let store = Arc::new(PostgresProductStore::from_config(pool, config));
        let index = Arc::new(OpenSearchIndex::from_config(config)?);
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);

        let stores: Vec<Arc<dyn UpsertEmbeddedProductDetails>> = vec![store.clone(), index];
        Ok(Self::new(store, embedder, stores))
    }

    /// Run one product through the pipeline.
    pub async fn embed_product(&self, message: &ProductMessage) -> bool {
        let Some(raw) = self.fetcher.fetch(&message.product_id).await else {
            error!(product_id = %message.product_id, "Raw product details not found");
            return false;
        };
        if is_stale(&raw, message) {
            return false;
        }

        let Some(embedded) = self.embedder.embed(&raw).await else {
            error!(product_id = %message.product_id, "Failed to embed product");
            return false;
        };

        let mut ok = true;
        for store in &self.stores {
            // every store is written even after one fails
            ok &= store.upsert(&embedded).await;
        }
        if !ok {
            error!(product_id = %message.product_id, "Failed to upsert embedded product");
        }
        ok
    }

    /// Run a batch of products through the pipeline. The result has one
    /// entry per message, `true` only if every stage succeeded for it.
    pub async fn embed_products(&self, messages: &[ProductMessage]) -> Vec<bool> {
        let mut results = vec![false; messages.len()];
        if messages.is_empty() {
            return results;
        }

        let ids: Vec<String> = messages.iter().map(|m| m.product_id.clone()).collect();
        let fetched = self.fetcher.fetch_many(&ids).await;

        // (message index, raw) for products that exist and are not stale
        let mut candidates: Vec<(usize, RawProductDetails)> = Vec::new();
        for (i, (message, raw)) in messages.iter().zip(fetched).enumerate() {
            match raw {
                Some(raw) if !is_stale(&raw, message) => candidates.push((i, raw)),
                Some(_) => {}
                None => {
                    error!(product_id = %message.product_id, "Raw product details not found");
                }
            }
        }

        let raws: Vec<RawProductDetails> = candidates.iter().map(|(_, r)| r.clone()).collect();
        let embedded = self.embedder.embed_many(&raws).await;

        let mut positions: Vec<usize> = Vec::new();
        let mut vectors: Vec<EmbeddedProductDetails> = Vec::new();
        for ((i, raw), emb) in candidates.iter().zip(embedded) {
            match emb {
                Some(emb) => {
                    positions.push(*i);
                    vectors.push(emb);
                }
                None => error!(product_id = %raw.product_id, "Failed to embed product"),
            }
        }

        let mut stored = vec![true; vectors.len()];
        for store in &self.stores {
            let flags = store.upsert_many(&vectors).await;
            for (slot, ok) in stored.iter_mut().zip(flags.iter().chain(std::iter::repeat(&false))) {
                *slot &= *ok;
            }
        }

        for (pos, ok) in positions.into_iter().zip(stored) {
            results[pos] = ok;
        }

        let failed: Vec<&str> = messages
            .iter()
            .zip(&results)
            .filter(|(_, ok)| !**ok)
            .map(|(m, _)| m.product_id.as_str())
            .collect();
        if !failed.is_empty() {
            error!(product_ids = ?failed, "Failed to embed products");
        }
        results
    }

    pub async fn close(&self) {
        self.fetcher.close().await;
        self.embedder.close().await;
        for store in &self.stores {
            store.close().await;
        }
    }
}

fn is_stale(raw: &RawProductDetails, message: &ProductMessage) -> bool {
    if raw.modified_date > message.modified_date {
        warn!(
            product_id = %raw.product_id,
            stored = %raw.modified_date,
            message = %message.modified_date,
            "Message is older than stored product"
        );
        return true;
    }
    false
}

/// Parse a `<product_id>@<modified_date>` command-line argument.
pub fn parse_product_arg(arg: &str) -> Result<ProductMessage> {
    let Some((product_id, date)) = arg.split_once('@') else {
        bail!("Expected <product_id>@<modified_date>, got '{}'", arg);
    };
    if product_id.is_empty() {
        bail!("Empty product id in '{}'", arg);
    }
    let Some(modified_date) = parse_date(date) else {
        bail!("Invalid modified date '{}' (expected YYYY-mm-dd HH:MM:SS[.ffffff])", date);
    };
    Ok(ProductMessage {
        product_id: product_id.to_string(),
        modified_date,
    })
}

/// `psearch embed`: run the pipeline for products named on the command line.
pub async fn run_embed(config: &Config, products: &[String]) -> Result<()> {
    let messages = products
        .iter()
        .map(|p| parse_product_arg(p))
        .collect::<Result<Vec<_>>>()?;

    let pipeline = EmbeddingPipeline::from_config(config)?;
    let results = if messages.len() == 1 {
        vec![pipeline.embed_product(&messages[0]).await]
    } else {
        pipeline.embed_products(&messages).await
    };
    pipeline.close().await;

    let embedded = results.iter().filter(|ok| **ok).count();
    let failed = results.len() - embedded;
    info!(embedded, failed, "Embedding run finished");

    println!("embed");
    println!("  products: {}", results.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    if failed > 0 {
        bail!("{} product(s) failed to embed", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn base_date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn raw(id: &str, modified: NaiveDateTime) -> RawProductDetails {
        RawProductDetails {
            product_id: id.to_string(),
            name: format!("Product {}", id),
            main_category: "c".to_string(),
            sub_category: "s".to_string(),
            image_url: String::new(),
            ratings: 3.5,
            discount_price: 1.0,
            actual_price: 2.0,
            modified_date: modified,
            created_date: modified,
        }
    }

    fn msg(id: &str, modified: NaiveDateTime) -> ProductMessage {
        ProductMessage {
            product_id: id.to_string(),
            modified_date: modified,
        }
    }

    struct FakeFetcher {
        products: HashMap<String, RawProductDetails>,
    }

    #[async_trait]
    impl FetchRawProductDetails for FakeFetcher {
        async fn fetch(&self, product_id: &str) -> Option<RawProductDetails> {
            self.products.get(product_id).cloned()
        }

        async fn fetch_many(&self, ids: &[String]) -> Vec<Option<RawProductDetails>> {
            ids.iter().map(|id| self.products.get(id).cloned()).collect()
        }
    }

    struct FakeEmbedder {
        fail: HashSet<String>,
    }

    #[async_trait]
    impl EmbedRawProductDetails for FakeEmbedder {
        async fn embed(&self, product: &RawProductDetails) -> Option<EmbeddedProductDetails> {
            if self.fail.contains(&product.product_id) {
                return None;
            }
            Some(EmbeddedProductDetails {
                product_id: product.product_id.clone(),
                embedding: vec![1.0, 0.0],
                modified_date: product.modified_date,
                created_date: product.created_date,
            })
        }

        async fn embed_many(
            &self,
            products: &[RawProductDetails],
        ) -> Vec<Option<EmbeddedProductDetails>> {
            let mut out = Vec::new();
            for p in products {
                out.push(self.embed(p).await);
            }
            out
        }
    }

    #[derive(Default)]
    struct FakeStore {
        fail: HashSet<String>,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpsertEmbeddedProductDetails for FakeStore {
        async fn upsert(&self, product: &EmbeddedProductDetails) -> bool {
            if self.fail.contains(&product.product_id) {
                return false;
            }
            self.written.lock().unwrap().push(product.product_id.clone());
            true
        }

        async fn upsert_many(&self, products: &[EmbeddedProductDetails]) -> Vec<bool> {
            let mut out = Vec::new();
            for p in products {
                out.push(self.upsert(p).await);
            }
            out
        }
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn pipeline(
        stored: Vec<RawProductDetails>,
        embed_fail: &[&str],
        pg_fail: &[&str],
        os_fail: &[&str],
    ) -> (EmbeddingPipeline, Arc<FakeStore>, Arc<FakeStore>) {
        let fetcher = Arc::new(FakeFetcher {
            products: stored
                .into_iter()
                .map(|p| (p.product_id.clone(), p))
                .collect(),
        });
        let embedder = Arc::new(FakeEmbedder {
            fail: set(embed_fail),
        });
        let pg = Arc::new(FakeStore {
            fail: set(pg_fail),
            ..Default::default()
        });
        let os = Arc::new(FakeStore {
            fail: set(os_fail),
            ..Default::default()
        });
        let p = EmbeddingPipeline::new(fetcher, embedder, vec![pg.clone(), os.clone()]);
        (p, pg, os)
    }

    #[tokio::test]
    async fn test_single_product_success() {
        let t = base_date();
        let (p, pg, os) = pipeline(vec![raw("1", t)], &[], &[], &[]);
        assert!(p.embed_product(&msg("1", t)).await);
        assert_eq!(*pg.written.lock().unwrap(), vec!["1".to_string()]);
        assert_eq!(*os.written.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_single_product_missing() {
        let (p, _, _) = pipeline(vec![], &[], &[], &[]);
        assert!(!p.embed_product(&msg("1", base_date())).await);
    }

    #[tokio::test]
    async fn test_single_product_stale_message() {
        let t = base_date();
        let (p, pg, _) = pipeline(vec![raw("1", t + Duration::seconds(5))], &[], &[], &[]);
        assert!(!p.embed_product(&msg("1", t)).await);
        assert!(pg.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_product_newer_message_is_fine() {
        let t = base_date();
        let (p, _, _) = pipeline(vec![raw("1", t)], &[], &[], &[]);
        assert!(p.embed_product(&msg("1", t + Duration::seconds(1))).await);
    }

    #[tokio::test]
    async fn test_single_product_one_store_fails() {
        let t = base_date();
        let (p, pg, _) = pipeline(vec![raw("1", t)], &[], &[], &["1"]);
        assert!(!p.embed_product(&msg("1", t)).await);
        // the other store is still written
        assert_eq!(pg.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_maps_every_failure_to_its_index() {
        let t = base_date();
        let stored = vec![
            raw("ok1", t),
            raw("stale", t + Duration::hours(1)),
            raw("embedfail", t),
            raw("pgfail", t),
            raw("osfail", t),
            raw("ok2", t),
        ];
        let (p, _, _) = pipeline(stored, &["embedfail"], &["pgfail"], &["osfail"]);
        let messages = vec![
            msg("ok1", t),
            msg("missing", t),
            msg("stale", t),
            msg("embedfail", t),
            msg("pgfail", t),
            msg("osfail", t),
            msg("ok2", t),
        ];
        let results = p.embed_products(&messages).await;
        assert_eq!(
            results,
            vec![true, false, false, false, false, false, true]
        );
    }

    #[tokio::test]
    async fn test_batch_single_failure() {
        let t = base_date();
        let stored: Vec<_> = (0..5).map(|i| raw(&i.to_string(), t)).collect();
        let (p, _, _) = pipeline(stored, &[], &["3"], &[]);
        let messages: Vec<_> = (0..5).map(|i| msg(&i.to_string(), t)).collect();
        let results = p.embed_products(&messages).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|ok| !**ok).count(), 1);
        assert!(!results[3]);
    }

    #[tokio::test]
    async fn test_batch_empty() {
        let (p, _, _) = pipeline(vec![], &[], &[], &[]);
        assert!(p.embed_products(&[]).await.is_empty());
    }

    #[test]
    fn test_parse_product_arg() {
        let m = parse_product_arg("0000000001@2024-06-01 12:00:00.250000").unwrap();
        assert_eq!(m.product_id, "0000000001");
        assert_eq!(
            m.modified_date,
            base_date() + Duration::milliseconds(250)
        );
        assert!(parse_product_arg("0000000001").is_err());
        assert!(parse_product_arg("@2024-06-01 12:00:00").is_err());
        assert!(parse_product_arg("1@soon").is_err());
    }
}
