// ABOUTME: Command implementations behind each CLI subcommand
// ABOUTME: Exports schema, load/apply, replicate, and state-row commands

pub mod load;
pub mod replicate;
pub mod schema;
pub mod state;

pub use load::{ApplyOptions, LoadOptions};
pub use replicate::ReplicateOptions;
