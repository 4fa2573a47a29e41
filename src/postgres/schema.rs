// ABOUTME: DDL for the changeset, comment, and replication state tables
// ABOUTME: Creates/truncates tables and builds constraints and indexes after bulk loads

use anyhow::{Context, Result};
use tokio_postgres::Client;

pub const CHANGESET_TABLE: &str = "osm_changeset";
pub const COMMENT_TABLE: &str = "osm_changeset_comment";
pub const STATE_TABLE: &str = "osm_changeset_state";

const CREATE_TABLES: &str = r#"
CREATE EXTENSION IF NOT EXISTS hstore;
CREATE TABLE osm_changeset (
    id bigint,
    user_id bigint,
    created_at timestamp without time zone,
    min_lat numeric(10,7),
    max_lat numeric(10,7),
    min_lon numeric(10,7),
    max_lon numeric(10,7),
    closed_at timestamp without time zone,
    open boolean,
    num_changes integer,
    user_name varchar(255),
    tags hstore
);
CREATE TABLE osm_changeset_comment (
    comment_changeset_id bigint not null,
    comment_ordinal integer not null,
    comment_user_id bigint,
    comment_user_name varchar(255),
    comment_date timestamp without time zone,
    comment_text text
);
CREATE TABLE osm_changeset_state (
    last_sequence bigint not null,
    last_timestamp timestamp without time zone,
    update_in_progress boolean not null default false
);
"#;

const INIT_STATE_ROW: &str =
    "INSERT INTO osm_changeset_state (last_sequence, last_timestamp, update_in_progress) VALUES (-1, NULL, false)";

const ADD_GEOMETRY: &str = r#"
CREATE EXTENSION IF NOT EXISTS postgis;
SELECT AddGeometryColumn('osm_changeset', 'geom', 4326, 'POLYGON', 2);
"#;

const DROP_INDEXES: &str = r#"
ALTER TABLE osm_changeset DROP CONSTRAINT IF EXISTS osm_changeset_pkey CASCADE;
ALTER TABLE osm_changeset_comment DROP CONSTRAINT IF EXISTS osm_changeset_comment_pkey;
DROP INDEX IF EXISTS user_name_idx, user_id_idx, created_idx, tags_idx, changeset_geom_gist;
"#;

const CREATE_CONSTRAINTS: &str = r#"
ALTER TABLE osm_changeset ADD CONSTRAINT osm_changeset_pkey PRIMARY KEY (id);
ALTER TABLE osm_changeset_comment ADD CONSTRAINT osm_changeset_comment_pkey
    PRIMARY KEY (comment_changeset_id, comment_ordinal);
"#;

const CREATE_INDEXES: &str = r#"
CREATE INDEX user_name_idx ON osm_changeset (user_name);
CREATE INDEX user_id_idx ON osm_changeset (user_id);
CREATE INDEX created_idx ON osm_changeset (created_at);
CREATE INDEX tags_idx ON osm_changeset USING GIN (tags);
"#;

const CREATE_GEOMETRY_INDEX: &str =
    "CREATE INDEX changeset_geom_gist ON osm_changeset USING GIST (geom)";

/// Create all tables and seed the state row with an uninitialized sequence.
pub async fn create_tables(client: &Client, with_geometry: bool) -> Result<()> {
    tracing::info!("Creating changeset tables");
    client
        .batch_execute(CREATE_TABLES)
        .await
        .context("Failed to create changeset tables")?;
    client
        .execute(INIT_STATE_ROW, &[])
        .await
        .context("Failed to initialize replication state row")?;

    if with_geometry {
        tracing::info!("Adding geometry column");
        client
            .batch_execute(ADD_GEOMETRY)
            .await
            .context("Failed to add geometry column (is PostGIS installed?)")?;
    }
    Ok(())
}

/// Empty the data tables and drop indexes so a bulk load runs fast.
///
/// The state row is left alone.
pub async fn truncate_tables(client: &Client) -> Result<()> {
    tracing::info!("Truncating changeset tables");
    client
        .batch_execute(&format!(
            "TRUNCATE TABLE {} CASCADE; TRUNCATE TABLE {} CASCADE;",
            COMMENT_TABLE, CHANGESET_TABLE
        ))
        .await
        .context("Failed to truncate changeset tables")?;
    client
        .batch_execute(DROP_INDEXES)
        .await
        .context("Failed to drop indexes")?;
    Ok(())
}

/// Add primary keys. Fails if the loaded data contains duplicate ids.
pub async fn create_constraints(client: &Client) -> Result<()> {
    tracing::info!("Creating constraints");
    client
        .batch_execute(CREATE_CONSTRAINTS)
        .await
        .context("Failed to create primary keys (duplicate changeset ids in input?)")?;
    Ok(())
}

/// Build secondary indexes, including the spatial one when a geometry column exists.
pub async fn create_indexes(client: &Client) -> Result<()> {
    tracing::info!("Creating indexes");
    client
        .batch_execute(CREATE_INDEXES)
        .await
        .context("Failed to create indexes")?;

    if has_geometry_column(client).await? {
        client
            .batch_execute(CREATE_GEOMETRY_INDEX)
            .await
            .context("Failed to create geometry index")?;
    }
    Ok(())
}

/// Whether `osm_changeset.geom` exists.
pub async fn has_geometry_column(client: &Client) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_name = $1 AND column_name = 'geom'
            )",
            &[&CHANGESET_TABLE],
        )
        .await
        .context("Failed to check for geometry column")?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_row_starts_uninitialized() {
        assert!(INIT_STATE_ROW.contains("VALUES (-1, NULL, false)"));
    }

    #[test]
    fn test_ddl_uses_table_constants() {
        for table in [CHANGESET_TABLE, COMMENT_TABLE, STATE_TABLE] {
            assert!(CREATE_TABLES.contains(&format!("CREATE TABLE {} (", table)));
        }
    }

    #[test]
    fn test_comment_primary_key_is_id_and_ordinal() {
        assert!(CREATE_CONSTRAINTS.contains("PRIMARY KEY (comment_changeset_id, comment_ordinal)"));
        assert!(DROP_INDEXES.contains("osm_changeset_comment_pkey"));
    }
}
