// ABOUTME: Schema commands - create the changeset tables or truncate them for a fresh load
// ABOUTME: Checks privileges and extensions before issuing DDL

use anyhow::{Context, Result};

use crate::postgres::{self, check_schema_capabilities};

/// Create tables, the state row, and optionally the geometry column.
pub async fn create(database_url: &str, with_geometry: bool) -> Result<()> {
    let client = postgres::connect_with_retry(database_url)
        .await
        .context("Failed to connect to target database")?;

    tracing::info!("Checking schema privileges...");
    check_schema_capabilities(&client)
        .await?
        .ensure_ready(with_geometry)?;

    postgres::schema::create_tables(&client, with_geometry).await?;
    tracing::info!("✓ Changeset tables created");
    Ok(())
}

/// Remove all changesets and comments and drop indexes. The state row stays.
pub async fn truncate(database_url: &str) -> Result<()> {
    let client = postgres::connect_with_retry(database_url)
        .await
        .context("Failed to connect to target database")?;
    postgres::schema::truncate_tables(&client).await?;
    tracing::info!("✓ Changeset tables truncated");
    Ok(())
}
