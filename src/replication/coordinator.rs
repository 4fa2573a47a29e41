// ABOUTME: ReplicationCoordinator - applies remote diffs in sequence order under the state lock
// ABOUTME: Advances the checkpoint after each committed diff and always releases the lock

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use super::source::{RemoteState, ReplicationSource};
use super::state::{BusyReason, LockOutcome, ReplicationError, StateStore};
use crate::changeset::input::from_gzip_bytes;
use crate::changeset::{BatchWriter, ChangesetStore, RecordParser, WriteMode, WriteStats};

/// Knobs for a replication run.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub batch_size: usize,
    /// Apply at most this many diffs per run.
    pub max_sequences: Option<u64>,
}

/// How a replication run ended. Fatal errors are returned as `Err` instead.
#[derive(Debug)]
pub enum ReplicationOutcome {
    /// Nothing newer on the server.
    UpToDate { sequence: i64 },
    /// Applied `first..=last`. `last < remote` when the run was capped.
    CaughtUp {
        first: i64,
        last: i64,
        remote: i64,
        stats: WriteStats,
    },
    /// Stopped at the first failing step. `last_applied` is durable.
    Failed {
        last_applied: i64,
        /// `None` when the server state itself could not be fetched
        failed_sequence: Option<i64>,
        error: anyhow::Error,
    },
    /// Another run holds the state row; nothing was changed.
    Contention(BusyReason),
}

impl ReplicationOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplicationOutcome::UpToDate { .. } | ReplicationOutcome::CaughtUp { .. } => 0,
            ReplicationOutcome::Contention(_) => 2,
            ReplicationOutcome::Failed { .. } => 3,
        }
    }
}

/// Drives one replication run against a state store, a diff source, and
/// changeset storage.
pub struct ReplicationCoordinator<S, R, W> {
    state: S,
    source: R,
    store: W,
    config: CoordinatorConfig,
}

impl<S, R, W> ReplicationCoordinator<S, R, W>
where
    S: StateStore,
    R: ReplicationSource,
    W: ChangesetStore,
{
    pub fn new(state: S, source: R, store: W, config: CoordinatorConfig) -> Self {
        Self {
            state,
            source,
            store,
            config,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    /// Run until caught up, capped, or failed.
    ///
    /// Once the lock is acquired it is released on every path, including
    /// errors returned from this function.
    pub async fn run(&mut self) -> Result<ReplicationOutcome> {
        if let LockOutcome::Busy(reason) = self.state.try_acquire().await? {
            tracing::warn!("Replication skipped: {}", reason);
            return Ok(ReplicationOutcome::Contention(reason));
        }
        tracing::debug!("Acquired replication lock");

        let result = self.run_locked().await;
        let timestamp = match &result {
            Ok((_, timestamp)) => *timestamp,
            Err(_) => None,
        };

        let released = self
            .state
            .release(timestamp)
            .await
            .context("Failed to release replication lock");

        match (result, released) {
            (Ok((outcome, _)), Ok(())) => Ok(outcome),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::error!("{:?}", release_err);
                Err(e)
            }
        }
    }

    /// Returns the outcome plus the timestamp to persist on release.
    async fn run_locked(&mut self) -> Result<(ReplicationOutcome, Option<NaiveDateTime>)> {
        let local = self.state.read().await?;
        if !local.is_initialized() {
            return Err(ReplicationError::Uninitialized.into());
        }
        self.state.mark_in_progress().await?;

        let remote = match self.source.current_state().await {
            Ok(remote) => remote,
            Err(error) => {
                tracing::error!("Failed to fetch replication state: {:?}", error);
                return Ok((
                    ReplicationOutcome::Failed {
                        last_applied: local.last_sequence,
                        failed_sequence: None,
                        error,
                    },
                    None,
                ));
            }
        };

        if remote.sequence <= local.last_sequence {
            tracing::info!(
                "Already up to date at sequence {} (server at {})",
                local.last_sequence,
                remote.sequence
            );
            let timestamp = if remote.sequence == local.last_sequence {
                remote.last_run
            } else {
                None
            };
            return Ok((
                ReplicationOutcome::UpToDate {
                    sequence: local.last_sequence,
                },
                timestamp,
            ));
        }

        let first = local.last_sequence + 1;
        let last = self.target_sequence(local.last_sequence, &remote);
        tracing::info!(
            "Replicating sequences {} through {} (server at {})",
            first,
            last,
            remote.sequence
        );

        let mut total = WriteStats::default();
        for sequence in first..=last {
            match self.apply_sequence(sequence).await {
                Ok(stats) => {
                    total.records += stats.records;
                    total.comments += stats.comments;
                    total.batches += stats.batches;
                }
                Err(error) => {
                    tracing::error!("Sequence {} failed: {:?}", sequence, error);
                    return Ok((
                        ReplicationOutcome::Failed {
                            last_applied: sequence - 1,
                            failed_sequence: Some(sequence),
                            error,
                        },
                        None,
                    ));
                }
            }

            self.state.advance(sequence).await?;
            tracing::debug!("Advanced replication state to {}", sequence);
        }

        // Server timestamp only describes the state once fully caught up
        let timestamp = if last == remote.sequence {
            remote.last_run
        } else {
            None
        };
        Ok((
            ReplicationOutcome::CaughtUp {
                first,
                last,
                remote: remote.sequence,
                stats: total,
            },
            timestamp,
        ))
    }

    fn target_sequence(&self, last_applied: i64, remote: &RemoteState) -> i64 {
        match self.config.max_sequences {
            Some(max) => {
                let max = i64::try_from(max.max(1)).unwrap_or(i64::MAX);
                remote.sequence.min(last_applied.saturating_add(max))
            }
            None => remote.sequence,
        }
    }

    async fn apply_sequence(&mut self, sequence: i64) -> Result<WriteStats> {
        let bytes = self
            .source
            .fetch_delta(sequence)
            .await
            .with_context(|| format!("Failed to fetch diff {}", sequence))?;
        let parser = RecordParser::new(from_gzip_bytes(bytes));
        let stats = BatchWriter::new(&mut self.store, WriteMode::Replace, self.config.batch_size)
            .write_all(parser)
            .await
            .with_context(|| format!("Failed to apply diff {}", sequence))?;
        tracing::info!(
            "Applied sequence {} ({} changesets, {} comments)",
            sequence,
            stats.records,
            stats.comments
        );
        Ok(stats)
    }
}
