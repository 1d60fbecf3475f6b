//! The `migrations` table: one row per applied migration.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;
use wabridge_common::{Error, Result};

use crate::capabilities::SchemaCapabilities;
use crate::database::{Database, SchemaTx};

pub const LEDGER_TABLE: &str = "migrations";

const CREATE_LEDGER: &str = "CREATE TABLE migrations (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const SELECT_ENTRIES: &str = "SELECT id, name, applied_at FROM migrations ORDER BY id ASC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i32,
    pub name: String,
    pub applied_at: Option<NaiveDateTime>,
}

/// Create the ledger if it is missing. Returns whether it was created.
pub fn ensure_ledger(tx: &mut SchemaTx<'_>) -> Result<bool> {
    if tx.table_exists(LEDGER_TABLE)? {
        return Ok(false);
    }
    tx.execute_batch(CREATE_LEDGER)
        .map_err(|e| Error::LedgerWrite(format!("failed to create migrations table: {e}")))?;
    info!("created migrations table");
    Ok(true)
}

/// Insert the ledger row for a migration. Runs in the same transaction as
/// the migration body.
pub fn record_migration(tx: &mut SchemaTx<'_>, id: i32, name: &str) -> Result<()> {
    let result = match tx {
        SchemaTx::Network(tx) => tx
            .execute(
                "INSERT INTO migrations (id, name) VALUES ($1, $2)",
                &[&id, &name],
            )
            .map(|_| ())
            .map_err(|e| e.to_string()),
        SchemaTx::Embedded(tx) => tx
            .execute(
                "INSERT INTO migrations (id, name) VALUES (?1, ?2)",
                rusqlite::params![id, name],
            )
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };
    result.map_err(|e| Error::LedgerWrite(format!("failed to record migration {id}: {e}")))
}

/// Every ledger row, ordered by id. The table must exist.
pub fn entries(db: &mut Database) -> Result<Vec<LedgerEntry>> {
    match db {
        Database::Network(client) => {
            let rows = client
                .query(SELECT_ENTRIES, &[])
                .map_err(|e| read_error(&e))?;
            rows.iter()
                .map(|row| {
                    Ok(LedgerEntry {
                        id: row.try_get(0)?,
                        name: row.try_get(1)?,
                        applied_at: row.try_get(2)?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, postgres::Error>>()
                .map_err(|e| read_error(&e))
        }
        Database::Embedded(conn) => {
            let mut stmt = conn.prepare(SELECT_ENTRIES).map_err(|e| read_error(&e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(LedgerEntry {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        applied_at: row.get(2)?,
                    })
                })
                .map_err(|e| read_error(&e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| read_error(&e))
        }
    }
}

pub fn applied_ids(db: &mut Database) -> Result<BTreeSet<i32>> {
    Ok(entries(db)?.into_iter().map(|entry| entry.id).collect())
}

fn read_error(e: &dyn std::fmt::Display) -> Error {
    Error::Database(format!("failed to read migrations table: {e}"))
}
