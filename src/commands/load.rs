// ABOUTME: Load a changeset dump (fresh or incremental) or apply a single local diff file
// ABOUTME: Fresh loads build primary keys and indexes once all rows are in

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::changeset::{open_file, BatchWriter, PgChangesetStore, RecordParser, WriteMode};
use crate::postgres::{self, schema};
use crate::replication::{IncrementalReconciler, ReconcileConfig};

pub struct LoadOptions {
    pub database_url: String,
    pub file: PathBuf,
    /// Skip ids already stored instead of expecting an empty table
    pub incremental: bool,
    /// With `incremental`, re-import changesets stored as open
    pub delete_open: bool,
    pub batch_size: usize,
}

pub struct ApplyOptions {
    pub database_url: String,
    pub file: PathBuf,
    pub batch_size: usize,
}

async fn open_store(database_url: &str) -> Result<PgChangesetStore> {
    let client = postgres::connect_with_retry(database_url)
        .await
        .context("Failed to connect to target database")?;
    let with_geometry = schema::has_geometry_column(&client).await?;
    if with_geometry {
        tracing::info!("Geometry column found; bounding boxes will be written to geom");
    }
    Ok(PgChangesetStore::new(client, with_geometry))
}

/// Bulk load a full changeset dump.
pub async fn run(opts: LoadOptions) -> Result<()> {
    let input = open_file(&opts.file)?;
    let parser = RecordParser::new(input);
    let mut store = open_store(&opts.database_url).await?;

    tracing::info!("Loading changesets from {}", opts.file.display());
    if opts.incremental {
        let stats = IncrementalReconciler::new(
            &mut store,
            ReconcileConfig {
                delete_open: opts.delete_open,
                batch_size: opts.batch_size,
            },
        )
        .run(parser)
        .await?;
        tracing::info!(
            "✓ Incremental load complete: {} new changesets, {} already present",
            stats.inserted,
            stats.skipped
        );
        return Ok(());
    }

    let stats = BatchWriter::new(&mut store, WriteMode::InsertOnly, opts.batch_size)
        .write_all(parser)
        .await?;

    schema::create_constraints(store.client()).await?;
    schema::create_indexes(store.client()).await?;
    tracing::info!(
        "✓ Load complete: {} changesets, {} comments",
        stats.records,
        stats.comments
    );
    Ok(())
}

/// Apply one replication diff from disk, replacing any stored versions.
///
/// Leaves the replication state row untouched.
pub async fn apply(opts: ApplyOptions) -> Result<()> {
    let input = open_file(&opts.file)?;
    let mut store = open_store(&opts.database_url).await?;

    tracing::info!("Applying diff {}", opts.file.display());
    let stats = BatchWriter::new(&mut store, WriteMode::Replace, opts.batch_size)
        .write_all(RecordParser::new(input))
        .await?;
    tracing::info!(
        "✓ Diff applied: {} changesets, {} comments",
        stats.records,
        stats.comments
    );
    Ok(())
}
