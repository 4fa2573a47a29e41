// ABOUTME: Library root for changeset-replicator
// ABOUTME: Streams OSM changeset XML into PostgreSQL and keeps it current from replication diffs

pub mod changeset;
pub mod commands;
pub mod config;
pub mod postgres;
pub mod replication;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
