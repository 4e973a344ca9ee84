use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::PostgresConfig;

/// Build a Postgres pool. Connections are opened on first use, so this
/// succeeds even when the database is not reachable yet.
pub fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.resolved_url())
        .context("Invalid Postgres connection URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy_with(options);

    Ok(pool)
}
