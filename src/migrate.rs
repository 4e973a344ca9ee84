//! Schema bootstrap for `psearch init`.
//!
//! Creates the pgvector extension, the raw and embedded product tables
//! and the OpenSearch k-NN index. Every step is idempotent.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db;
use crate::opensearch::OpenSearchIndex;

/// DDL for the Postgres side, in execution order.
pub fn schema_statements(config: &Config) -> Vec<String> {
    let raw = &config.postgres.raw_product_table;
    let embedded = &config.postgres.embedded_product_table;
    let index_name = format!("{}_embedding_hnsw_idx", embedded.replace('.', "_"));

    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {raw} (
            product_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            main_category TEXT NOT NULL,
            sub_category TEXT NOT NULL,
            image_url TEXT NOT NULL,
            ratings DOUBLE PRECISION NOT NULL,
            discount_price DOUBLE PRECISION NOT NULL,
            actual_price DOUBLE PRECISION NOT NULL,
            modified_date TIMESTAMP NOT NULL,
            created_date TIMESTAMP NOT NULL
        )
        "#
        ),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {embedded} (
            product_id TEXT PRIMARY KEY,
            product_embedding vector({dims}) NOT NULL,
            modified_date TIMESTAMP NOT NULL,
            created_date TIMESTAMP NOT NULL
        )
        "#,
            dims = config.embedding.dims
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {embedded} USING hnsw (product_embedding vector_cosine_ops)"
        ),
    ]
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.postgres)?;

    for statement in schema_statements(config) {
        sqlx::query(&statement)
            .execute(&pool)
            .await
            .with_context(|| format!("Migration failed: {}", statement.trim()))?;
    }
    pool.close().await;

    let index = OpenSearchIndex::from_config(config)?;
    let created = index
        .ensure_index(config.embedding.dims)
        .await
        .context("Failed to create OpenSearch index")?;

    println!("init");
    println!("  postgres: {}, {}", config.postgres.raw_product_table, config.postgres.embedded_product_table);
    println!(
        "  opensearch index: {} ({})",
        config.opensearch.index,
        if created { "created" } else { "exists" }
    );
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
[postgres]
url = "postgres://localhost/products"
embedded_product_table = "search.embedded_products"

[opensearch]
endpoint = "http://localhost:9200"

[sqs]
queue_url = "https://sqs.ap-east-1.amazonaws.com/123/products"
region = "ap-east-1"

[embedding]
provider = "sagemaker"
dims = 384
sagemaker_endpoint = "sentence-bert"
region = "ap-east-1"
"#;

    #[test]
    fn test_schema_statements() {
        let config = parse_config(CONFIG).unwrap();
        let stmts = schema_statements(&config);
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].contains("EXTENSION IF NOT EXISTS vector"));
        assert!(stmts[1].contains("CREATE TABLE IF NOT EXISTS raw_products"));
        assert!(stmts[2].contains("CREATE TABLE IF NOT EXISTS search.embedded_products"));
        assert!(stmts[2].contains("vector(384)"));
        assert!(stmts[3].contains("search_embedded_products_embedding_hnsw_idx"));
        assert!(stmts[3].contains("vector_cosine_ops"));
    }
}
