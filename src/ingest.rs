//! Ingestion pipeline: catalogue CSV → raw products → Postgres + SQS.
//!
//! Every product is written to Postgres and announced on the queue. The
//! two writes run independently; a product is ingested only if both
//! succeed. The queue message carries the product's `modified_date`, so the
//! embedding worker can tell a stale announcement from a current one.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::aws::{self, AwsCredentials};
use crate::config::Config;
use crate::db;
use crate::models::RawProductDetails;
use crate::postgres::PostgresProductStore;
use crate::sqs::SqsQueue;
use crate::traits::UpsertRawProductDetails;

pub struct IngestionPipeline {
    stores: Vec<Arc<dyn UpsertRawProductDetails>>,
}

impl IngestionPipeline {
    pub fn new(stores: Vec<Arc<dyn UpsertRawProductDetails>>) -> Self {
        Self { stores }
    }

    /// Postgres first, then SQS.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(&config.postgres)?;
        let store = Arc::new(PostgresProductStore::from_config(pool, config));
        let queue = Arc::new(SqsQueue::new(&config.sqs)?);
        let stores: Vec<Arc<dyn UpsertRawProductDetails>> = vec![store, queue];
        Ok(Self::new(stores))
    }

    pub async fn upsert_raw_product(&self, product: &RawProductDetails) -> bool {
        let mut ok = true;
        for store in &self.stores {
            ok &= store.upsert(product).await;
        }
        if !ok {
            error!(product_id = %product.product_id, "Failed to upsert raw product");
        }
        ok
    }

    /// One result per product, in input order.
    pub async fn upsert_raw_products(&self, products: &[RawProductDetails]) -> Vec<bool> {
        let mut results = vec![true; products.len()];
        for store in &self.stores {
            let flags = store.upsert_many(products).await;
            for (slot, ok) in results
                .iter_mut()
                .zip(flags.iter().chain(std::iter::repeat(&false)))
            {
                *slot &= *ok;
            }
        }

        let failed: Vec<&str> = products
            .iter()
            .zip(&results)
            .filter(|(_, ok)| !**ok)
            .map(|(p, _)| p.product_id.as_str())
            .collect();
        if !failed.is_empty() {
            error!(count = failed.len(), product_ids = ?failed, "Failed to upsert raw products");
        }
        results
    }

    pub async fn close(&self) {
        for store in &self.stores {
            store.close().await;
        }
    }
}

// ============ CSV ============

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    main_category: String,
    #[serde(default)]
    sub_category: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    ratings: String,
    #[serde(default)]
    discount_price: String,
    #[serde(default)]
    actual_price: String,
}

/// Parse a product catalogue CSV.
///
/// Product ids are the 1-based row number, zero-padded to 10 digits.
/// Prices keep only their digits (`"₹1,099"` → `1099`), fall back to the
/// other price column when empty, and are multiplied by `exchange_rate`.
/// Every row gets the same `modified_date`.
pub fn parse_products_csv<R: Read>(
    reader: R,
    exchange_rate: f64,
    modified_date: NaiveDateTime,
) -> Result<Vec<RawProductDetails>> {
    let non_digits = Regex::new(r"\D+")?;
    let mut rdr = csv::Reader::from_reader(reader);
    let mut products = Vec::new();

    for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
        let index = i + 1;
        let row = row.with_context(|| format!("Invalid CSV row {}", index))?;
        let product_id = format!("{:010}", index);

        let ratings = match row.ratings.trim() {
            "" => 0.0,
            s => s.parse::<f64>().unwrap_or_else(|_| {
                warn!(product_id = %product_id, ratings = %s, "Unparseable ratings, using 0");
                0.0
            }),
        };

        products.push(RawProductDetails {
            discount_price: parse_price(&non_digits, &row.discount_price, &row.actual_price)
                * exchange_rate,
            actual_price: parse_price(&non_digits, &row.actual_price, &row.discount_price)
                * exchange_rate,
            product_id,
            name: row.name,
            main_category: row.main_category,
            sub_category: row.sub_category,
            image_url: row.image,
            ratings,
            modified_date,
            created_date: Local::now().naive_local(),
        });
    }

    Ok(products)
}

/// Digits of `primary`, or of `fallback` when `primary` is empty.
fn parse_price(non_digits: &Regex, primary: &str, fallback: &str) -> f64 {
    let text = [primary.trim(), fallback.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("0");
    non_digits
        .replace_all(text, "")
        .parse::<f64>()
        .unwrap_or(0.0)
}

// ============ Command ============

/// Read the CSV from a local path or an `s3://bucket/key` URL.
async fn read_source(config: &Config, source: &str) -> Result<Vec<u8>> {
    if source.starts_with("s3://") {
        let Some((bucket, key)) = aws::parse_s3_url(source) else {
            bail!("Invalid S3 URL '{}' (expected s3://bucket/key)", source);
        };
        let region = config
            .ingest
            .s3_region
            .as_deref()
            .unwrap_or(&config.sqs.region);
        let credentials = AwsCredentials::from_env()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        info!(bucket, key, region, "Downloading catalogue from S3");
        return aws::download_object(&client, &credentials, region, bucket, key, None).await;
    }

    let path = Path::new(source);
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// `psearch ingest`: parse a catalogue CSV and upsert every product.
pub async fn run_ingest(config: &Config, source: &str) -> Result<()> {
    let started = Local::now().naive_local();
    let bytes = read_source(config, source).await?;
    let products = parse_products_csv(bytes.as_slice(), config.ingest.exchange_rate, started)?;
    info!(source, count = products.len(), "Parsed catalogue");

    let pipeline = IngestionPipeline::from_config(config)?;
    let results = if products.len() == 1 {
        vec![pipeline.upsert_raw_product(&products[0]).await]
    } else {
        pipeline.upsert_raw_products(&products).await
    };
    pipeline.close().await;

    let ingested = results.iter().filter(|ok| **ok).count();
    let failed = results.len() - ingested;

    println!("ingest {}", source);
    println!("  products: {}", products.len());
    println!("  ingested: {}", ingested);
    println!("  failed: {}", failed);

    if failed > 0 {
        bail!("{} product(s) failed to ingest", failed);
    }
    println!("ok");
    Ok(())
}
