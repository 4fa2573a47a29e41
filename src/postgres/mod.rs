// ABOUTME: PostgreSQL plumbing: connections, schema DDL, and capability checks
// ABOUTME: Everything here is independent of the changeset pipeline itself

pub mod connection;
pub mod privileges;
pub mod schema;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use privileges::{check_schema_capabilities, SchemaCapabilities};
