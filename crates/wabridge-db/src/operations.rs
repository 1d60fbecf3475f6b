use rusqlite::Connection;
use tracing::debug;
use wabridge_common::{Error, Result};

use crate::capabilities::{SchemaCapabilities, SqliteCatalog};
use crate::rebuild::{RebuildTable, rebuild_table};

/// One step of an embedded migration body.
///
/// Each step checks the catalog before it acts, so replaying a body against a
/// schema that already has its effects is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedOp {
    /// Run `ddl` unless `table` already exists.
    CreateTable {
        table: &'static str,
        ddl: &'static str,
    },
    /// `ALTER TABLE table ADD COLUMN column definition` unless the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    /// SQL that is idempotent on its own, such as `CREATE INDEX IF NOT EXISTS`.
    Idempotent(&'static str),
    RebuildTable(RebuildTable),
}

impl EmbeddedOp {
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        let mut catalog = SqliteCatalog::new(conn);
        match self {
            EmbeddedOp::CreateTable { table, ddl } => {
                if catalog.table_exists(table)? {
                    debug!("table {table} already exists");
                    return Ok(());
                }
                conn.execute_batch(ddl).map_err(|e| {
                    Error::MigrationExecution(format!("failed to create table {table}: {e}"))
                })
            }
            EmbeddedOp::AddColumn {
                table,
                column,
                definition,
            } => {
                if catalog.column_exists(table, column)? {
                    debug!("column {table}.{column} already exists");
                    return Ok(());
                }
                conn.execute_batch(&format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {definition}"
                ))
                .map_err(|e| {
                    Error::MigrationExecution(format!(
                        "failed to add column {table}.{column}: {e}"
                    ))
                })
            }
            EmbeddedOp::Idempotent(sql) => conn
                .execute_batch(sql)
                .map_err(|e| Error::MigrationExecution(format!("statement failed: {e}"))),
            EmbeddedOp::RebuildTable(change) => rebuild_table(conn, change).map(|_| ()),
        }
    }
}
