// ABOUTME: Keeping a changeset database current: remote diffs, state row, dump reconciliation
// ABOUTME: The coordinator ties the state store, diff source, and batch writer together

pub mod coordinator;
pub mod reconciler;
pub mod source;
pub mod state;

pub use coordinator::{CoordinatorConfig, ReplicationCoordinator, ReplicationOutcome};
pub use reconciler::{IncrementalReconciler, ReconcileConfig, ReconcileStats};
pub use source::{sequence_path, HttpReplicationSource, RemoteState, ReplicationSource};
pub use state::{
    BusyReason, LockOutcome, PgStateStore, ReplicationError, ReplicationState, StateStore,
    UNINITIALIZED_SEQUENCE,
};
