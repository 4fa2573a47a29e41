// ABOUTME: ReplicationState store - the single state row that tracks replication progress
// ABOUTME: Doubles as a cross-process mutex via an advisory lock plus an in-progress flag

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use tokio_postgres::Client;

use crate::postgres::schema::STATE_TABLE;

/// Sequence value meaning "never seeded".
pub const UNINITIALIZED_SEQUENCE: i64 = -1;

/// Contents of the state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationState {
    /// Last fully applied diff, or -1 if unseeded
    pub last_sequence: i64,
    /// Server-reported run time of the last applied diff
    pub last_timestamp: Option<NaiveDateTime>,
    pub update_in_progress: bool,
}

impl ReplicationState {
    pub fn is_initialized(&self) -> bool {
        self.last_sequence > UNINITIALIZED_SEQUENCE
    }
}

/// Why `try_acquire` refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// Another live session holds the advisory lock.
    SessionClaimHeld,
    /// The row says a run is in progress. Either one is running somewhere we
    /// cannot see, or a previous run died without cleaning up; clearing it is
    /// an operator decision (`unlock`).
    InProgressFlagSet,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyReason::SessionClaimHeld => write!(f, "another replication run holds the lock"),
            BusyReason::InProgressFlagSet => write!(
                f,
                "update_in_progress is set; if no run is active, clear it with `unlock`"
            ),
        }
    }
}

/// Result of a non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Busy(BusyReason),
}

/// Replication errors callers need to tell apart from I/O failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error(
        "replication state is uninitialized (last_sequence = -1); \
         seed it with `init-state --sequence <N>` before replicating"
    )]
    Uninitialized,
    #[error("cannot advance to sequence {attempted}: stored sequence is {stored}")]
    SequenceGap { stored: i64, attempted: i64 },
    #[error("state table must hold exactly one row, found {rows}")]
    StateRowCount { rows: usize },
}

/// The acquire/read/advance/release contract around the state row.
///
/// `try_acquire` never waits. Once it returns `Acquired`, the caller must call
/// `release` on every exit path, success or failure.
#[async_trait]
pub trait StateStore: Send {
    async fn try_acquire(&mut self) -> Result<LockOutcome>;

    async fn read(&mut self) -> Result<ReplicationState>;

    /// Set the durable in-progress flag.
    async fn mark_in_progress(&mut self) -> Result<()>;

    /// Record `sequence` as applied. Only valid when the stored sequence is
    /// exactly `sequence - 1`.
    async fn advance(&mut self, sequence: i64) -> Result<()>;

    /// Clear the in-progress flag, store `timestamp` if given, drop the lock.
    async fn release(&mut self, timestamp: Option<NaiveDateTime>) -> Result<()>;
}

/// State row in PostgreSQL, guarded by a session-scoped advisory lock.
///
/// Uses its own connection: if this process dies, the server drops the
/// session and with it the advisory lock. The in-progress flag survives the
/// crash and keeps later runs out until an operator clears it.
pub struct PgStateStore {
    client: Client,
    lock_key: i64,
    holds_claim: bool,
}

impl PgStateStore {
    pub fn new(client: Client, lock_key: i64) -> Self {
        Self {
            client,
            lock_key,
            holds_claim: false,
        }
    }

    /// Seed `last_sequence` so replication knows where to start.
    pub async fn seed(&mut self, sequence: i64) -> Result<()> {
        anyhow::ensure!(sequence >= 0, "sequence must be non-negative, got {}", sequence);
        self.client
            .execute(
                &format!(
                    "UPDATE {} SET last_sequence = $1, last_timestamp = NULL",
                    STATE_TABLE
                ),
                &[&sequence],
            )
            .await
            .context("Failed to seed replication state")?;
        tracing::info!("Replication state seeded at sequence {}", sequence);
        Ok(())
    }

    /// Clear a stale in-progress flag left behind by a crashed run.
    ///
    /// Refuses while another session holds the advisory lock.
    pub async fn force_clear(&mut self) -> Result<bool> {
        if !self.claim().await? {
            anyhow::bail!("Another replication run is active; refusing to clear its flag");
        }
        let updated = self
            .client
            .execute(
                &format!(
                    "UPDATE {} SET update_in_progress = false WHERE update_in_progress",
                    STATE_TABLE
                ),
                &[],
            )
            .await
            .context("Failed to clear update_in_progress")?;
        self.unclaim().await?;
        Ok(updated > 0)
    }

    async fn claim(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.lock_key])
            .await
            .context("Failed to request advisory lock")?;
        let acquired: bool = row.get(0);
        self.holds_claim = acquired;
        Ok(acquired)
    }

    async fn unclaim(&mut self) -> Result<()> {
        if !self.holds_claim {
            return Ok(());
        }
        self.client
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.lock_key])
            .await
            .context("Failed to release advisory lock")?;
        self.holds_claim = false;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn try_acquire(&mut self) -> Result<LockOutcome> {
        if !self.claim().await? {
            return Ok(LockOutcome::Busy(BusyReason::SessionClaimHeld));
        }

        let state = match self.read().await {
            Ok(state) => state,
            Err(e) => {
                self.unclaim().await?;
                return Err(e);
            }
        };
        if state.update_in_progress {
            self.unclaim().await?;
            return Ok(LockOutcome::Busy(BusyReason::InProgressFlagSet));
        }
        Ok(LockOutcome::Acquired)
    }

    async fn read(&mut self) -> Result<ReplicationState> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT last_sequence, last_timestamp, update_in_progress FROM {}",
                    STATE_TABLE
                ),
                &[],
            )
            .await
            .context("Failed to read replication state")?;

        if rows.len() != 1 {
            return Err(ReplicationError::StateRowCount { rows: rows.len() }.into());
        }
        let row = &rows[0];
        Ok(ReplicationState {
            last_sequence: row.get(0),
            last_timestamp: row.get(1),
            update_in_progress: row.get(2),
        })
    }

    async fn mark_in_progress(&mut self) -> Result<()> {
        self.client
            .execute(
                &format!("UPDATE {} SET update_in_progress = true", STATE_TABLE),
                &[],
            )
            .await
            .context("Failed to mark replication in progress")?;
        Ok(())
    }

    async fn advance(&mut self, sequence: i64) -> Result<()> {
        let updated = self
            .client
            .execute(
                &format!(
                    "UPDATE {} SET last_sequence = $1 WHERE last_sequence = $2",
                    STATE_TABLE
                ),
                &[&sequence, &(sequence - 1)],
            )
            .await
            .with_context(|| format!("Failed to advance replication state to {}", sequence))?;

        if updated != 1 {
            let stored = self.read().await?.last_sequence;
            return Err(ReplicationError::SequenceGap {
                stored,
                attempted: sequence,
            }
            .into());
        }
        Ok(())
    }

    async fn release(&mut self, timestamp: Option<NaiveDateTime>) -> Result<()> {
        let cleared = self
            .client
            .execute(
                &format!(
                    "UPDATE {} SET update_in_progress = false, \
                     last_timestamp = COALESCE($1, last_timestamp)",
                    STATE_TABLE
                ),
                &[&timestamp],
            )
            .await
            .context("Failed to clear update_in_progress");

        // Drop the session claim even if the flag update failed
        let unlocked = self.unclaim().await;
        cleared?;
        unlocked
    }
}
