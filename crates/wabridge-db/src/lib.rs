pub mod builtin;
pub mod capabilities;
pub mod database;
pub mod history;
pub mod ids;
pub mod ledger;
pub mod migrations;
pub mod operations;
pub mod rebuild;
pub mod registry;

pub use capabilities::{ColumnInfo, SchemaCapabilities};
pub use database::{Database, SchemaTx};
pub use history::{HistoryMessage, MessageHistory, NewHistoryMessage, TrimOutcome};
pub use ids::generate_random_id;
pub use ledger::LedgerEntry;
pub use migrations::{MigrationReport, MigrationStatus, Migrator, initialize};
pub use operations::EmbeddedOp;
pub use rebuild::{RebuildOutcome, RebuildTable};
pub use registry::{MigrationDefinition, Registry};
