// ABOUTME: In-memory fakes of the storage, state, and diff-source traits for unit tests
// ABOUTME: Mirrors the transactional and locking behavior of the PostgreSQL implementations

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::changeset::{ChangesetRecord, ChangesetStore};
use crate::replication::{
    BusyReason, LockOutcome, RemoteState, ReplicationError, ReplicationSource, ReplicationState,
    StateStore,
};

pub fn created_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap()
}

/// A minimal record with the given id.
pub fn record(id: i64) -> ChangesetRecord {
    ChangesetRecord::new(id, created_at())
}

/// Changeset XML document holding one bare changeset per id.
pub fn changeset_xml(ids: &[i64]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm>\n");
    for id in ids {
        xml.push_str(&format!(
            "  <changeset id=\"{}\" created_at=\"2024-01-02T03:04:05Z\" open=\"false\"/>\n",
            id
        ));
    }
    xml.push_str("</osm>\n");
    xml
}

pub fn gzip(body: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Changeset table in a map. Each commit is all-or-nothing.
#[derive(Default)]
pub struct MemoryChangesetStore {
    pub rows: BTreeMap<i64, ChangesetRecord>,
    pub commits: u64,
}

impl MemoryChangesetStore {
    pub fn with_records(records: impl IntoIterator<Item = ChangesetRecord>) -> Self {
        Self {
            rows: records.into_iter().map(|r| (r.id, r)).collect(),
            commits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn snapshot(&self) -> BTreeMap<i64, ChangesetRecord> {
        self.rows.clone()
    }

    pub fn comment_count(&self) -> usize {
        self.rows.values().map(|r| r.comments.len()).sum()
    }
}

#[async_trait]
impl ChangesetStore for MemoryChangesetStore {
    async fn commit_batch(
        &mut self,
        records: &[ChangesetRecord],
        replace_ids: &[i64],
    ) -> Result<u64> {
        let replacing: HashSet<i64> = replace_ids.iter().copied().collect();
        let mut seen = HashSet::new();
        for record in records {
            let stored = self.rows.contains_key(&record.id) && !replacing.contains(&record.id);
            if stored || !seen.insert(record.id) {
                bail!("duplicate key value violates unique constraint (id)=({})", record.id);
            }
        }

        for id in replace_ids {
            self.rows.remove(id);
        }
        let mut comments = 0;
        for record in records {
            comments += record.comments.len() as u64;
            self.rows.insert(record.id, record.clone());
        }
        self.commits += 1;
        Ok(comments)
    }

    async fn max_changeset_id(&mut self) -> Result<Option<i64>> {
        Ok(self.rows.keys().next_back().copied())
    }

    async fn open_changeset_ids(&mut self) -> Result<Vec<i64>> {
        Ok(self
            .rows
            .values()
            .filter(|r| r.open == Some(true))
            .map(|r| r.id)
            .collect())
    }
}

/// State row plus lock bookkeeping.
pub struct MemoryStateStore {
    pub state: ReplicationState,
    /// Simulates another session holding the advisory lock
    pub claim_held_elsewhere: bool,
    pub locked: bool,
    pub releases: u32,
}

impl MemoryStateStore {
    pub fn at(last_sequence: i64) -> Self {
        Self {
            state: ReplicationState {
                last_sequence,
                last_timestamp: None,
                update_in_progress: false,
            },
            claim_held_elsewhere: false,
            locked: false,
            releases: 0,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn try_acquire(&mut self) -> Result<LockOutcome> {
        if self.claim_held_elsewhere || self.locked {
            return Ok(LockOutcome::Busy(BusyReason::SessionClaimHeld));
        }
        if self.state.update_in_progress {
            return Ok(LockOutcome::Busy(BusyReason::InProgressFlagSet));
        }
        self.locked = true;
        Ok(LockOutcome::Acquired)
    }

    async fn read(&mut self) -> Result<ReplicationState> {
        Ok(self.state)
    }

    async fn mark_in_progress(&mut self) -> Result<()> {
        assert!(self.locked, "mark_in_progress without the lock");
        self.state.update_in_progress = true;
        Ok(())
    }

    async fn advance(&mut self, sequence: i64) -> Result<()> {
        assert!(self.locked, "advance without the lock");
        if self.state.last_sequence != sequence - 1 {
            return Err(ReplicationError::SequenceGap {
                stored: self.state.last_sequence,
                attempted: sequence,
            }
            .into());
        }
        self.state.last_sequence = sequence;
        Ok(())
    }

    async fn release(&mut self, timestamp: Option<NaiveDateTime>) -> Result<()> {
        self.state.update_in_progress = false;
        if timestamp.is_some() {
            self.state.last_timestamp = timestamp;
        }
        self.locked = false;
        self.releases += 1;
        Ok(())
    }
}

/// Replication server serving gzip diffs from memory.
pub struct FakeSource {
    pub remote: RemoteState,
    pub deltas: HashMap<i64, Vec<u8>>,
    pub fail_state: bool,
    pub fail_at: Option<i64>,
    fetched: Mutex<Vec<i64>>,
}

impl FakeSource {
    pub fn new(sequence: i64, last_run: Option<NaiveDateTime>) -> Self {
        Self {
            remote: RemoteState { sequence, last_run },
            deltas: HashMap::new(),
            fail_state: false,
            fail_at: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn add_delta(&mut self, sequence: i64, ids: &[i64]) {
        self.add_raw_delta(sequence, &changeset_xml(ids));
    }

    pub fn add_raw_delta(&mut self, sequence: i64, xml: &str) {
        self.deltas.insert(sequence, gzip(xml));
    }

    /// Sequences requested so far, in order.
    pub fn fetched(&self) -> Vec<i64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn clear_fetched(&mut self) {
        self.fetched.lock().unwrap().clear();
    }
}

#[async_trait]
impl ReplicationSource for FakeSource {
    async fn current_state(&self) -> Result<RemoteState> {
        if self.fail_state {
            bail!("connection reset fetching state.yaml");
        }
        Ok(self.remote)
    }

    async fn fetch_delta(&self, sequence: i64) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(sequence);
        if self.fail_at == Some(sequence) {
            bail!("HTTP 503 for sequence {}", sequence);
        }
        match self.deltas.get(&sequence) {
            Some(bytes) => Ok(bytes.clone()),
            None => bail!("HTTP 404 for sequence {}", sequence),
        }
    }
}
