// ABOUTME: IncrementalReconciler - replays a fresh full dump, inserting only unseen changesets
// ABOUTME: Skips ids at or below the stored maximum; optionally replaces stored open changesets

use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::changeset::writer::Progress;
use crate::changeset::{BatchWriter, ChangesetRecord, ChangesetStore, ParseError, WriteMode};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Replace stored changesets still flagged open with their dump version.
    pub delete_open: bool,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Highest id stored before the run
    pub max_known_id: Option<i64>,
    /// Stored open changesets replaced from the dump
    pub reopened: u64,
    pub skipped: u64,
    pub inserted: u64,
    pub comments: u64,
}

/// Incremental import of a periodic full dump.
///
/// Superset-safe, not delta-exact: a changeset that closed and changed between
/// two dumps is only picked up if it was still open at the previous import
/// and `delete_open` is set.
///
/// Open rows are replaced inside the batch that carries their new version, so
/// a run that fails part way leaves the rest of them in place for a rerun.
pub struct IncrementalReconciler<'a, S: ChangesetStore> {
    store: &'a mut S,
    config: ReconcileConfig,
}

impl<'a, S: ChangesetStore> IncrementalReconciler<'a, S> {
    pub fn new(store: &'a mut S, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub async fn run<I>(self, records: I) -> Result<ReconcileStats>
    where
        I: IntoIterator<Item = Result<ChangesetRecord, ParseError>>,
    {
        let max_known_id = self.store.max_changeset_id().await?;
        let open: HashSet<i64> = if self.config.delete_open {
            self.store.open_changeset_ids().await?.into_iter().collect()
        } else {
            HashSet::new()
        };

        match max_known_id {
            Some(max) => tracing::info!(
                "Skipping changesets up to id {} ({} open changesets queued for re-import)",
                max,
                open.len()
            ),
            None => tracing::info!("No stored changesets; importing everything"),
        }

        let mut stats = ReconcileStats {
            max_known_id,
            ..Default::default()
        };

        let mut writer = BatchWriter::new(self.store, WriteMode::InsertOnly, self.config.batch_size);
        let progress = Progress::start();
        let mut seen = 0u64;
        for record in records {
            let record = record.context("Failed to parse changeset input")?;
            seen += 1;
            progress.tick(seen);

            if open.contains(&record.id) {
                stats.reopened += 1;
                writer.push_replacing(record).await?;
                continue;
            }
            if max_known_id.is_some_and(|max| record.id <= max) {
                stats.skipped += 1;
                continue;
            }
            writer.push(record).await?;
        }
        writer.flush().await?;

        let written = writer.stats();
        progress.finish(written);
        stats.inserted = written.records;
        stats.comments = written.comments;

        tracing::info!(
            "Incremental import done: {} inserted, {} skipped",
            stats.inserted,
            stats.skipped
        );
        Ok(stats)
    }
}
