// ABOUTME: Changeset ingestion: record model, streaming XML parser, batched writer
// ABOUTME: Shared by bulk loads, local diff application, and replication

pub mod input;
pub mod model;
pub mod parser;
pub mod writer;

pub use input::{open_file, ChangesetInput, Compression};
pub use model::{parse_timestamp, BoundingBox, ChangesetRecord, Comment};
pub use parser::{ParseError, RecordParser};
pub use writer::{
    BatchWriter, ChangesetStore, PgChangesetStore, WriteMode, WriteStats, DEFAULT_BATCH_SIZE,
};
