// ABOUTME: BatchWriter buffers parsed changesets and commits them in transactions
// ABOUTME: PgChangesetStore owns the insert/delete SQL against osm_changeset tables

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use super::model::{ChangesetRecord, Comment};
use super::parser::ParseError;
use crate::postgres::schema::{CHANGESET_TABLE, COMMENT_TABLE};

/// PostgreSQL has a limit of 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

/// Log parse/write progress every this many records.
pub const PROGRESS_INTERVAL: u64 = 10_000;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

const CHANGESET_COLUMNS: [&str; 12] = [
    "id",
    "user_id",
    "created_at",
    "min_lat",
    "max_lat",
    "min_lon",
    "max_lon",
    "closed_at",
    "open",
    "num_changes",
    "user_name",
    "tags",
];

const COMMENT_COLUMNS: [&str; 6] = [
    "comment_changeset_id",
    "comment_ordinal",
    "comment_user_id",
    "comment_user_name",
    "comment_date",
    "comment_text",
];

/// How a batch treats ids that may already be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain insert; a duplicate id is a constraint violation.
    InsertOnly,
    /// Delete any stored row (and its comments) for each id, then insert.
    Replace,
}

/// Durable storage for changesets.
///
/// Every `commit_batch` call is its own transaction: either all of the batch
/// is visible afterwards or none of it is.
#[async_trait]
pub trait ChangesetStore: Send {
    /// Write one batch and commit it. Stored rows (and comments) for
    /// `replace_ids` are deleted first, in the same transaction; every other
    /// record is a plain insert. Returns the number of comment rows written.
    async fn commit_batch(&mut self, records: &[ChangesetRecord], replace_ids: &[i64])
        -> Result<u64>;

    /// Highest stored changeset id, or `None` when the table is empty.
    async fn max_changeset_id(&mut self) -> Result<Option<i64>>;

    /// Ids of stored changesets still flagged open.
    async fn open_changeset_ids(&mut self) -> Result<Vec<i64>>;
}

/// Counters for one writer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub records: u64,
    pub comments: u64,
    pub batches: u64,
}

/// Accumulates records and commits them `batch_size` at a time.
///
/// A crash loses at most the batch currently buffered; every batch already
/// flushed has been committed by the store.
pub struct BatchWriter<'a, S: ChangesetStore> {
    store: &'a mut S,
    mode: WriteMode,
    batch_size: usize,
    buffer: Vec<ChangesetRecord>,
    /// Ids in `buffer` to replace rather than insert (insert-only mode)
    replacing: Vec<i64>,
    stats: WriteStats,
}

impl<'a, S: ChangesetStore> BatchWriter<'a, S> {
    pub fn new(store: &'a mut S, mode: WriteMode, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            mode,
            batch_size,
            buffer: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
            replacing: Vec::new(),
            stats: WriteStats::default(),
        }
    }

    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Buffer one record, flushing when the batch is full.
    pub async fn push(&mut self, record: ChangesetRecord) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Buffer one record that replaces any stored row with the same id,
    /// whatever the writer's mode.
    pub async fn push_replacing(&mut self, record: ChangesetRecord) -> Result<()> {
        self.replacing.push(record.id);
        self.push(record).await
    }

    /// Commit whatever is buffered.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut batch = std::mem::take(&mut self.buffer);
        let mut replace_ids = std::mem::take(&mut self.replacing);
        if self.mode == WriteMode::Replace {
            dedupe_last_wins(&mut batch);
            replace_ids = batch.iter().map(|r| r.id).collect();
        }

        let comments = self
            .store
            .commit_batch(&batch, &replace_ids)
            .await
            .with_context(|| format!("Failed to commit batch of {} changesets", batch.len()))?;

        self.stats.records += batch.len() as u64;
        self.stats.comments += comments;
        self.stats.batches += 1;
        tracing::debug!(
            "Committed batch {} ({} changesets, {} comments)",
            self.stats.batches,
            batch.len(),
            comments
        );

        batch.clear();
        self.buffer = batch;
        Ok(())
    }

    /// Drain a parser into storage and commit the trailing partial batch.
    pub async fn write_all<I>(mut self, records: I) -> Result<WriteStats>
    where
        I: IntoIterator<Item = Result<ChangesetRecord, ParseError>>,
    {
        let progress = Progress::start();
        for record in records {
            let record = record.context("Failed to parse changeset input")?;
            self.push(record).await?;
            progress.tick(self.stats.records + self.buffer.len() as u64);
        }
        self.flush().await?;
        progress.finish(&self.stats);
        Ok(self.stats)
    }
}

/// Keep only the last occurrence of each id, preserving document order.
fn dedupe_last_wins(batch: &mut Vec<ChangesetRecord>) {
    let mut last_index: HashMap<i64, usize> = HashMap::with_capacity(batch.len());
    for (idx, record) in batch.iter().enumerate() {
        last_index.insert(record.id, idx);
    }
    if last_index.len() == batch.len() {
        return;
    }
    let mut idx = 0;
    batch.retain(|record| {
        let keep = last_index.get(&record.id) == Some(&idx);
        idx += 1;
        keep
    });
}

/// Periodic progress logging with a cumulative rate.
pub(crate) struct Progress {
    started: Instant,
}

impl Progress {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub(crate) fn tick(&self, seen: u64) {
        if seen > 0 && seen % PROGRESS_INTERVAL == 0 {
            let secs = self.started.elapsed().as_secs_f64().max(0.001);
            tracing::info!(
                "Parsed {} changesets ({:.0}/sec cumulative)",
                seen,
                seen as f64 / secs
            );
        }
    }

    pub(crate) fn finish(&self, stats: &WriteStats) {
        tracing::info!(
            "Wrote {} changesets and {} comments in {} batches ({:.1}s)",
            stats.records,
            stats.comments,
            stats.batches,
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// Changeset storage in PostgreSQL.
///
/// Owns its connection so each batch can run in an explicit transaction.
pub struct PgChangesetStore {
    client: Client,
    with_geometry: bool,
}

impl PgChangesetStore {
    pub fn new(client: Client, with_geometry: bool) -> Self {
        Self {
            client,
            with_geometry,
        }
    }

    /// Get a reference to the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ChangesetStore for PgChangesetStore {
    async fn commit_batch(
        &mut self,
        records: &[ChangesetRecord],
        replace_ids: &[i64],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let with_geometry = self.with_geometry;
        let tx = self
            .client
            .transaction()
            .await
            .context("Failed to begin batch transaction")?;

        if !replace_ids.is_empty() {
            delete_ids(&tx, replace_ids).await?;
        }

        insert_changesets(&tx, records).await?;
        let comments = insert_comments(&tx, records).await?;

        if with_geometry {
            let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
            tx.execute(&build_geometry_update(), &[&ids])
                .await
                .context("Failed to populate changeset geometry")?;
        }

        tx.commit().await.context("Failed to commit batch")?;
        Ok(comments)
    }

    async fn max_changeset_id(&mut self) -> Result<Option<i64>> {
        let row = self
            .client
            .query_one(&format!("SELECT MAX(id) FROM {}", CHANGESET_TABLE), &[])
            .await
            .context("Failed to read maximum changeset id")?;
        Ok(row.get(0))
    }

    async fn open_changeset_ids(&mut self) -> Result<Vec<i64>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT id FROM {} WHERE open = true ORDER BY id",
                    CHANGESET_TABLE
                ),
                &[],
            )
            .await
            .context("Failed to find open changesets")?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

/// Comments first, so a comment row never outlives its changeset.
async fn delete_ids(tx: &Transaction<'_>, ids: &[i64]) -> Result<()> {
    tx.execute(
        &format!(
            "DELETE FROM {} WHERE comment_changeset_id = ANY($1)",
            COMMENT_TABLE
        ),
        &[&ids],
    )
    .await
    .context("Failed to delete existing comments")?;
    tx.execute(
        &format!("DELETE FROM {} WHERE id = ANY($1)", CHANGESET_TABLE),
        &[&ids],
    )
    .await
    .context("Failed to delete existing changesets")?;
    Ok(())
}

async fn insert_changesets(tx: &Transaction<'_>, records: &[ChangesetRecord]) -> Result<()> {
    let rows_per_statement = MAX_PARAMS / CHANGESET_COLUMNS.len();

    for chunk in records.chunks(rows_per_statement) {
        let tags: Vec<HashMap<String, Option<String>>> =
            chunk.iter().map(ChangesetRecord::hstore_tags).collect();
        let bounds: Vec<_> = chunk.iter().map(|r| r.bbox.unwrap_or_default()).collect();

        let mut params: Vec<&(dyn ToSql + Sync)> =
            Vec::with_capacity(chunk.len() * CHANGESET_COLUMNS.len());
        for ((record, tags), bbox) in chunk.iter().zip(&tags).zip(&bounds) {
            params.push(&record.id);
            params.push(&record.user_id);
            params.push(&record.created_at);
            params.push(&bbox.min_lat);
            params.push(&bbox.max_lat);
            params.push(&bbox.min_lon);
            params.push(&bbox.max_lon);
            params.push(&record.closed_at);
            params.push(&record.open);
            params.push(&record.num_changes);
            params.push(&record.user_name);
            params.push(tags);
        }

        let query = build_insert_query(CHANGESET_TABLE, &CHANGESET_COLUMNS, chunk.len());
        tx.execute(&query, &params)
            .await
            .with_context(|| format!("Failed to insert {} changesets", chunk.len()))?;
    }
    Ok(())
}

/// Flattened comment row: (changeset id, ordinal, comment).
type CommentRow<'r> = (i64, i32, &'r Comment);

async fn insert_comments(tx: &Transaction<'_>, records: &[ChangesetRecord]) -> Result<u64> {
    let rows: Vec<CommentRow<'_>> = records
        .iter()
        .flat_map(|record| {
            record
                .comments
                .iter()
                .enumerate()
                .map(move |(ordinal, comment)| (record.id, ordinal as i32, comment))
        })
        .collect();
    if rows.is_empty() {
        return Ok(0);
    }

    let rows_per_statement = MAX_PARAMS / COMMENT_COLUMNS.len();
    for chunk in rows.chunks(rows_per_statement) {
        let mut params: Vec<&(dyn ToSql + Sync)> =
            Vec::with_capacity(chunk.len() * COMMENT_COLUMNS.len());
        for (changeset_id, ordinal, comment) in chunk {
            params.push(changeset_id);
            params.push(ordinal);
            params.push(&comment.user_id);
            params.push(&comment.user_name);
            params.push(&comment.date);
            params.push(&comment.text);
        }

        let query = build_insert_query(COMMENT_TABLE, &COMMENT_COLUMNS, chunk.len());
        tx.execute(&query, &params)
            .await
            .with_context(|| format!("Failed to insert {} comments", chunk.len()))?;
    }
    Ok(rows.len() as u64)
}

/// Build a multi-row insert:
/// ```sql
/// INSERT INTO table (c1, c2) VALUES ($1, $2), ($3, $4), ...
/// ```
fn build_insert_query(table: &str, columns: &[&str], num_rows: usize) -> String {
    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        value_rows.join(", ")
    )
}

fn build_geometry_update() -> String {
    format!(
        "UPDATE {} SET geom = ST_SetSRID(ST_MakeEnvelope(min_lon, min_lat, max_lon, max_lat), 4326) \
         WHERE id = ANY($1) AND min_lat IS NOT NULL AND max_lat IS NOT NULL \
         AND min_lon IS NOT NULL AND max_lon IS NOT NULL",
        CHANGESET_TABLE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{record, MemoryChangesetStore};

    fn ok_records(ids: impl IntoIterator<Item = i64>) -> Vec<Result<ChangesetRecord, ParseError>> {
        ids.into_iter().map(|id| Ok(record(id))).collect()
    }

    #[test]
    fn test_build_insert_query_single_row() {
        let query = build_insert_query("osm_changeset", &["id", "user_id", "tags"], 1);
        assert_eq!(
            query,
            "INSERT INTO osm_changeset (id, user_id, tags) VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn test_build_insert_query_multiple_rows() {
        let query = build_insert_query("osm_changeset_comment", &["a", "b"], 3);
        assert!(query.ends_with("VALUES ($1, $2), ($3, $4), ($5, $6)"));
    }

    #[test]
    fn test_statement_chunks_stay_under_parameter_limit() {
        let rows = MAX_PARAMS / CHANGESET_COLUMNS.len();
        assert!(rows * CHANGESET_COLUMNS.len() <= 65535);
        let rows = MAX_PARAMS / COMMENT_COLUMNS.len();
        assert!(rows * COMMENT_COLUMNS.len() <= 65535);
    }

    #[test]
    fn test_geometry_update_guards_partial_bbox() {
        let sql = build_geometry_update();
        assert!(sql.contains("ST_MakeEnvelope(min_lon, min_lat, max_lon, max_lat)"));
        assert!(sql.contains("min_lat IS NOT NULL"));
        assert!(sql.contains("4326"));
    }

    #[test]
    fn test_dedupe_last_wins() {
        let mut first = record(1);
        first.num_changes = Some(1);
        let mut again = record(1);
        again.num_changes = Some(2);
        let mut batch = vec![first, record(2), again, record(3)];

        dedupe_last_wins(&mut batch);

        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(batch[1].num_changes, Some(2));
    }

    #[tokio::test]
    async fn test_batches_are_ceil_of_records_over_batch_size() {
        let mut store = MemoryChangesetStore::default();
        let writer = BatchWriter::new(&mut store, WriteMode::InsertOnly, 4);
        let stats = writer.write_all(ok_records(1..=10)).await.unwrap();

        assert_eq!(stats.records, 10);
        assert_eq!(stats.batches, 3);
        assert_eq!(store.commits, 3);
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_empty_batch() {
        let mut store = MemoryChangesetStore::default();
        let writer = BatchWriter::new(&mut store, WriteMode::InsertOnly, 5);
        let stats = writer.write_all(ok_records(1..=10)).await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(store.commits, 2);
    }

    #[tokio::test]
    async fn test_insert_only_duplicate_is_fatal() {
        let mut store = MemoryChangesetStore::default();
        let writer = BatchWriter::new(&mut store, WriteMode::InsertOnly, 2);
        let err = writer
            .write_all(ok_records([1, 2, 3, 2]))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate"));
        // First full batch stays committed; the failing batch left nothing behind
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let mut first = record(7);
        first.comments.push(Default::default());
        first.comments.push(Default::default());
        let delta = || vec![Ok(first.clone()), Ok(record(8))];

        let mut store = MemoryChangesetStore::default();
        BatchWriter::new(&mut store, WriteMode::Replace, 10)
            .write_all(delta())
            .await
            .unwrap();
        let once = store.snapshot();

        BatchWriter::new(&mut store, WriteMode::Replace, 10)
            .write_all(delta())
            .await
            .unwrap();
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.comment_count(), 2);
    }

    #[tokio::test]
    async fn test_parse_error_stops_after_committed_batches() {
        let mut store = MemoryChangesetStore::default();
        let mut input = ok_records(1..=4);
        input.push(Err(ParseError::UnexpectedEof { open_elements: 1 }));
        input.extend(ok_records(5..=6));

        let err = BatchWriter::new(&mut store, WriteMode::InsertOnly, 2)
            .write_all(input)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("unclosed"));
        assert_eq!(store.len(), 4);
        assert_eq!(store.commits, 2);
    }

    #[tokio::test]
    async fn test_push_replacing_swaps_stored_row_in_insert_only_mode() {
        let mut stored = record(3);
        stored.open = Some(true);
        let mut store = MemoryChangesetStore::with_records([record(1), stored]);

        let mut closed = record(3);
        closed.open = Some(false);
        let mut writer = BatchWriter::new(&mut store, WriteMode::InsertOnly, 10);
        writer.push_replacing(closed).await.unwrap();
        writer.push(record(4)).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.stats().batches, 1);

        assert_eq!(store.rows[&3].open, Some(false));
        assert_eq!(store.len(), 3);
        assert_eq!(store.commits, 1);
    }
}
