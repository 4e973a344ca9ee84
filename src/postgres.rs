//! Postgres adapter: raw product table plus a pgvector-backed embedding table.
//!
//! One [`PostgresProductStore`] implements four use cases over a shared
//! [`PgPool`]:
//!
//! | Trait | Table |
//! |-------|-------|
//! | [`FetchRawProductDetails`] | `raw_product_table` |
//! | [`UpsertRawProductDetails`] | `raw_product_table` |
//! | [`UpsertEmbeddedProductDetails`] | `embedded_product_table` |
//! | [`QuerySimilarProductDetails`] | `embedded_product_table` (cosine `<=>`) |
//!
//! Upserts are conditional on `modified_date`: a row is only replaced when
//! the incoming record is at least as new. Batches are written one chunk per
//! transaction; a failed chunk is rolled back and all of its items reported
//! as failed.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, error};

use crate::config::{Config, PostgresConfig};
use crate::models::{
    EmbeddedProductDetails, EmbeddedQueryDetails, RawProductDetails, SimilarProduct,
};
use crate::traits::{
    FetchRawProductDetails, QuerySimilarProductDetails, UpsertEmbeddedProductDetails,
    UpsertRawProductDetails,
};

const RAW_COLUMNS: &str = "product_id, name, main_category, sub_category, image_url, \
                           ratings, discount_price, actual_price, modified_date, created_date";

pub struct PostgresProductStore {
    pool: PgPool,
    raw_table: String,
    embedded_table: String,
    fetch_batch_size: usize,
    upsert_batch_size: usize,
    default_threshold: f64,
    default_top_k: usize,
    max_workers: usize,
}

impl PostgresProductStore {
    pub fn new(pool: PgPool, config: &PostgresConfig) -> Self {
        Self {
            pool,
            raw_table: config.raw_product_table.clone(),
            embedded_table: config.embedded_product_table.clone(),
            fetch_batch_size: config.fetch_batch_size,
            upsert_batch_size: config.upsert_batch_size,
            default_threshold: 0.5,
            default_top_k: 10,
            max_workers: 10,
        }
    }

    /// Store with query defaults taken from `[search]`.
    pub fn from_config(pool: PgPool, config: &Config) -> Self {
        let mut store = Self::new(pool, &config.postgres);
        store.default_threshold = config.search.default_threshold;
        store.default_top_k = config.search.default_limit;
        store.max_workers = config.search.max_workers;
        store
    }

    async fn fetch_chunk(&self, ids: &[String]) -> Result<Vec<RawProductDetails>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM {} WHERE product_id = ANY($1)",
            RAW_COLUMNS, self.raw_table
        );
        sqlx::query_as::<_, RawProductDetails>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
    }

    async fn upsert_raw_chunk(&self, products: &[RawProductDetails]) -> Result<(), sqlx::Error> {
        let sql = raw_upsert_sql(&self.raw_table);
        let mut tx = self.pool.begin().await?;
        for p in products {
            sqlx::query(&sql)
                .bind(&p.product_id)
                .bind(&p.name)
                .bind(&p.main_category)
                .bind(&p.sub_category)
                .bind(&p.image_url)
                .bind(p.ratings)
                .bind(p.discount_price)
                .bind(p.actual_price)
                .bind(p.modified_date)
                .bind(p.created_date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    async fn upsert_embedded_chunk(
        &self,
        products: &[EmbeddedProductDetails],
    ) -> Result<(), sqlx::Error> {
        let sql = embedded_upsert_sql(&self.embedded_table);
        let mut tx = self.pool.begin().await?;
        for p in products {
            sqlx::query(&sql)
                .bind(&p.product_id)
                .bind(vec_to_pgvector(&p.embedding))
                .bind(p.modified_date)
                .bind(p.created_date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    async fn query_similar(
        &self,
        query: &EmbeddedQueryDetails,
        threshold: f64,
        top_k: usize,
    ) -> Result<Vec<SimilarProduct>, sqlx::Error> {
        let sql = similarity_sql(&self.embedded_table);
        let rows: Vec<(String, f64)> = sqlx::query_as(&sql)
            .bind(vec_to_pgvector(&query.embedding))
            .bind(threshold)
            .bind(top_k as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(product_id, score)| SimilarProduct { product_id, score })
            .collect())
    }
}

#[async_trait]
impl FetchRawProductDetails for PostgresProductStore {
    async fn fetch(&self, product_id: &str) -> Option<RawProductDetails> {
        let sql = format!(
            "SELECT {} FROM {} WHERE product_id = $1",
            RAW_COLUMNS, self.raw_table
        );
        match sqlx::query_as::<_, RawProductDetails>(&sql)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                error!(product_id = %product_id, error = %e, "Error fetching product details from Postgres");
                None
            }
        }
    }

    async fn fetch_many(&self, product_ids: &[String]) -> Vec<Option<RawProductDetails>> {
        let mut results = Vec::with_capacity(product_ids.len());
        for chunk in product_ids.chunks(self.fetch_batch_size) {
            match self.fetch_chunk(chunk).await {
                Ok(rows) => results.extend(align_to_ids(chunk, rows)),
                Err(e) => {
                    error!(count = chunk.len(), error = %e, "Error fetching product details batch from Postgres");
                    results.extend(std::iter::repeat_with(|| None).take(chunk.len()));
                }
            }
        }
        results
    }

    async fn close(&self) -> bool {
        self.pool.close().await;
        true
    }
}

#[async_trait]
impl UpsertRawProductDetails for PostgresProductStore {
    async fn upsert(&self, product: &RawProductDetails) -> bool {
        match self.upsert_raw_chunk(std::slice::from_ref(product)).await {
            Ok(()) => true,
            Err(e) => {
                error!(product_id = %product.product_id, error = %e, "Error upserting raw product details");
                false
            }
        }
    }

    async fn upsert_many(&self, products: &[RawProductDetails]) -> Vec<bool> {
        let mut successes = Vec::with_capacity(products.len());
        for chunk in products.chunks(self.upsert_batch_size) {
            match self.upsert_raw_chunk(chunk).await {
                Ok(()) => {
                    debug!(count = chunk.len(), "Upserted raw product batch");
                    successes.extend(std::iter::repeat(true).take(chunk.len()));
                }
                Err(e) => {
                    let ids: Vec<&str> = chunk.iter().map(|p| p.product_id.as_str()).collect();
                    error!(product_ids = ?ids, error = %e, "Failed to upsert raw product batch");
                    successes.extend(std::iter::repeat(false).take(chunk.len()));
                }
            }
        }
        successes
    }

    async fn close(&self) -> bool {
        self.pool.close().await;
        true
    }
}

#[async_trait]
impl UpsertEmbeddedProductDetails for PostgresProductStore {
    async fn upsert(&self, product: &EmbeddedProductDetails) -> bool {
        match self
            .upsert_embedded_chunk(std::slice::from_ref(product))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(product_id = %product.product_id, error = %e, "Error upserting embedded product details");
                false
            }
        }
    }

    async fn upsert_many(&self, products: &[EmbeddedProductDetails]) -> Vec<bool> {
        let mut successes = Vec::with_capacity(products.len());
        for chunk in products.chunks(self.upsert_batch_size) {
            match self.upsert_embedded_chunk(chunk).await {
                Ok(()) => successes.extend(std::iter::repeat(true).take(chunk.len())),
                Err(e) => {
                    let ids: Vec<&str> = chunk.iter().map(|p| p.product_id.as_str()).collect();
                    error!(product_ids = ?ids, error = %e, "Failed to upsert embedded product batch");
                    successes.extend(std::iter::repeat(false).take(chunk.len()));
                }
            }
        }
        successes
    }

    async fn close(&self) -> bool {
        self.pool.close().await;
        true
    }
}

#[async_trait]
impl QuerySimilarProductDetails for PostgresProductStore {
    async fn query(
        &self,
        query: &EmbeddedQueryDetails,
        threshold: Option<f64>,
        top_k: Option<usize>,
    ) -> Option<Vec<SimilarProduct>> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let top_k = top_k.unwrap_or(self.default_top_k);
        match self.query_similar(query, threshold, top_k).await {
            Ok(hits) => Some(hits),
            Err(e) => {
                error!(error = %e, "Error querying similar products from Postgres");
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
        self.pool.close().await;
        true
    }
}

/// Put fetched rows back in the order of `ids`; ids without a row become `None`.
fn align_to_ids(ids: &[String], rows: Vec<RawProductDetails>) -> Vec<Option<RawProductDetails>> {
    let by_id: HashMap<String, RawProductDetails> = rows
        .into_iter()
        .map(|row| (row.product_id.clone(), row))
        .collect();
    ids.iter().map(|id| by_id.get(id).cloned()).collect()
}

/// Render a vector as a pgvector text literal, e.g. `[0.1,0.2]`.
pub fn vec_to_pgvector(vec: &[f32]) -> String {
    let values: Vec<String> = vec.iter().map(|v| v.to_string()).collect();
    format!("[{}]", values.join(","))
}

fn raw_upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} ({RAW_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (product_id) DO UPDATE SET
            name = EXCLUDED.name,
            main_category = EXCLUDED.main_category,
            sub_category = EXCLUDED.sub_category,
            image_url = EXCLUDED.image_url,
            ratings = EXCLUDED.ratings,
            discount_price = EXCLUDED.discount_price,
            actual_price = EXCLUDED.actual_price,
            modified_date = EXCLUDED.modified_date,
            created_date = EXCLUDED.created_date
        WHERE {table}.modified_date <= EXCLUDED.modified_date
        "#
    )
}

fn embedded_upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (product_id, product_embedding, modified_date, created_date)
        VALUES ($1, $2::vector, $3, $4)
        ON CONFLICT (product_id) DO UPDATE SET
            product_embedding = EXCLUDED.product_embedding,
            modified_date = EXCLUDED.modified_date,
            created_date = EXCLUDED.created_date
        WHERE {table}.modified_date <= EXCLUDED.modified_date
        "#
    )
}

fn similarity_sql(table: &str) -> String {
    format!(
        r#"
        SELECT product_id, 1 - (product_embedding <=> $1::vector) AS score
        FROM {table}
        WHERE 1 - (product_embedding <=> $1::vector) >= $2
        ORDER BY product_embedding <=> $1::vector
        LIMIT $3
        "#
    )
}
