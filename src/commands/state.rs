// ABOUTME: Operator commands for the replication state row
// ABOUTME: Seed the starting sequence, show the row, clear a stale in-progress flag

use anyhow::{bail, Context, Result};

use crate::postgres;
use crate::replication::{LockOutcome, PgStateStore, ReplicationState, StateStore};

async fn open(database_url: &str, lock_key: i64) -> Result<PgStateStore> {
    let client = postgres::connect_with_retry(database_url)
        .await
        .context("Failed to connect to target database")?;
    Ok(PgStateStore::new(client, lock_key))
}

/// Set the sequence replication continues from.
pub async fn init_state(database_url: &str, lock_key: i64, sequence: i64) -> Result<()> {
    let mut store = open(database_url, lock_key).await?;
    if let LockOutcome::Busy(reason) = store.try_acquire().await? {
        bail!("Cannot seed replication state: {}", reason);
    }

    let seeded = store.seed(sequence).await;
    store.release(None).await?;
    seeded?;
    tracing::info!("✓ Replication will continue with sequence {}", sequence + 1);
    Ok(())
}

/// Print the state row.
pub async fn status(database_url: &str, lock_key: i64, json: bool) -> Result<()> {
    let mut store = open(database_url, lock_key).await?;
    let state = store.read().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&to_json(&state))?);
    } else {
        print!("{}", render(&state));
    }
    Ok(())
}

/// Clear `update_in_progress` after a crashed run.
pub async fn unlock(database_url: &str, lock_key: i64) -> Result<()> {
    let mut store = open(database_url, lock_key).await?;
    if store.force_clear().await? {
        tracing::info!("✓ Cleared update_in_progress");
    } else {
        tracing::info!("update_in_progress was not set; nothing to do");
    }
    Ok(())
}

fn to_json(state: &ReplicationState) -> serde_json::Value {
    serde_json::json!({
        "last_sequence": state.last_sequence,
        "initialized": state.is_initialized(),
        "last_timestamp": state
            .last_timestamp
            .map(|ts| ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        "update_in_progress": state.update_in_progress,
    })
}

fn render(state: &ReplicationState) -> String {
    let sequence = if state.is_initialized() {
        state.last_sequence.to_string()
    } else {
        "uninitialized (run init-state)".to_string()
    };
    let timestamp = state
        .last_timestamp
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "Last sequence:      {}\nLast timestamp:     {}\nUpdate in progress: {}\n",
        sequence, timestamp, state.update_in_progress
    )
}
