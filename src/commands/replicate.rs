// ABOUTME: Replicate command - fetch and apply remote diffs until caught up
// ABOUTME: Opens separate state and data sessions and reports the run outcome

use anyhow::{Context, Result};

use crate::changeset::PgChangesetStore;
use crate::config::ReplicationSettings;
use crate::postgres::{self, schema};
use crate::replication::{
    CoordinatorConfig, HttpReplicationSource, PgStateStore, ReplicationCoordinator,
    ReplicationOutcome,
};

pub struct ReplicateOptions {
    pub database_url: String,
    pub settings: ReplicationSettings,
    pub batch_size: usize,
}

pub async fn run(opts: ReplicateOptions) -> Result<ReplicationOutcome> {
    let source = HttpReplicationSource::new(&opts.settings)?;

    // The advisory lock lives on this session for the whole run
    let state_client = postgres::connect_with_retry(&opts.database_url)
        .await
        .context("Failed to connect to target database")?;
    let state = PgStateStore::new(state_client, opts.settings.lock_key);

    let data_client = postgres::connect_with_retry(&opts.database_url)
        .await
        .context("Failed to connect to target database")?;
    let with_geometry = schema::has_geometry_column(&data_client).await?;
    let store = PgChangesetStore::new(data_client, with_geometry);

    tracing::info!("Replicating from {}", opts.settings.base_url);
    let mut coordinator = ReplicationCoordinator::new(
        state,
        source,
        store,
        CoordinatorConfig {
            batch_size: opts.batch_size,
            max_sequences: opts.settings.max_sequences_per_run,
        },
    );
    let outcome = coordinator.run().await?;
    report(&outcome);
    Ok(outcome)
}

fn report(outcome: &ReplicationOutcome) {
    match outcome {
        ReplicationOutcome::UpToDate { sequence } => {
            tracing::info!("✓ Already up to date at sequence {}", sequence);
        }
        ReplicationOutcome::CaughtUp {
            first,
            last,
            remote,
            stats,
        } => {
            tracing::info!(
                "✓ Applied sequences {}..={} ({} changesets, {} comments)",
                first,
                last,
                stats.records,
                stats.comments
            );
            if last < remote {
                tracing::info!(
                    "{} sequences remain; they will be applied on the next run",
                    remote - last
                );
            }
        }
        ReplicationOutcome::Failed {
            last_applied,
            failed_sequence,
            error,
        } => {
            match failed_sequence {
                Some(seq) => tracing::error!(
                    "Replication stopped at sequence {}; state remains at {}",
                    seq,
                    last_applied
                ),
                None => tracing::error!(
                    "Could not read server state; state remains at {}",
                    last_applied
                ),
            }
            tracing::error!("{:#}", error);
        }
        ReplicationOutcome::Contention(reason) => {
            tracing::warn!("Replication not started: {}", reason);
        }
    }
}
