//! Catalog introspection for both backends.
//!
//! SQLite cannot express "add column if absent" or "create table if absent"
//! as a guarded statement the way PostgreSQL can, so embedded migrations ask
//! these questions up front. Every check runs on whatever connection or
//! transaction the caller hands in, so it sees DDL issued earlier in the same
//! transaction.

use postgres::GenericClient;
use rusqlite::{Connection, OptionalExtension, params};
use wabridge_common::{Error, Result};

/// One column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type. Empty for SQLite columns declared without one.
    pub declared_type: String,
    pub not_null: bool,
    /// Default expression as written in the DDL.
    pub default: Option<String>,
    pub primary_key: bool,
}

pub trait SchemaCapabilities {
    fn table_exists(&mut self, table: &str) -> Result<bool>;

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool>;

    /// Declared type of `table.column`, or `None` if either is absent.
    fn column_type(&mut self, table: &str, column: &str) -> Result<Option<String>>;

    /// Columns of `table` in declaration order. Empty if the table is absent.
    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;
}

/// Reads `sqlite_master` and `pragma_table_info`.
#[derive(Clone, Copy)]
pub struct SqliteCatalog<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCatalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl SchemaCapabilities for SqliteCatalog<'_> {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let exists: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!("failed to check table {table}: {e}"))
            })?;
        Ok(exists == 1)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!(
                    "failed to check column {table}.{column}: {e}"
                ))
            })?;
        Ok(count > 0)
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT type FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                Error::SchemaIntrospection(format!(
                    "failed to read type of {table}.{column}: {e}"
                ))
            })
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, type, \"notnull\", dflt_value, pk
                 FROM pragma_table_info(?1)
                 ORDER BY cid",
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!("failed to prepare table_info query: {e}"))
            })?;

        let rows = stmt
            .query_map(params![table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    default: row.get(3)?,
                    primary_key: row.get::<_, i64>(4)? > 0,
                })
            })
            .map_err(|e| {
                Error::SchemaIntrospection(format!("failed to list columns of {table}: {e}"))
            })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::SchemaIntrospection(format!("failed to read column row: {e}")))
    }
}

/// Reads `information_schema` within the current schema.
///
/// Catalog columns use domain types the driver will not decode directly, so
/// every selected value is cast to a base type.
pub struct PostgresCatalog<'c, C: GenericClient> {
    client: &'c mut C,
}

impl<'c, C: GenericClient> PostgresCatalog<'c, C> {
    pub fn new(client: &'c mut C) -> Self {
        Self { client }
    }
}

impl<C: GenericClient> SchemaCapabilities for PostgresCatalog<'_, C> {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = current_schema() AND table_name = $1::text
                 )",
                &[&table],
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!("failed to check table {table}: {e}"))
            })?;
        row.try_get(0)
            .map_err(|e| Error::SchemaIntrospection(format!("failed to check table {table}: {e}")))
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.columns
                     WHERE table_schema = current_schema()
                       AND table_name = $1::text AND column_name = $2::text
                 )",
                &[&table, &column],
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!(
                    "failed to check column {table}.{column}: {e}"
                ))
            })?;
        row.try_get(0).map_err(|e| {
            Error::SchemaIntrospection(format!("failed to check column {table}.{column}: {e}"))
        })
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        let row = self
            .client
            .query_opt(
                "SELECT data_type::text FROM information_schema.columns
                 WHERE table_schema = current_schema()
                   AND table_name = $1::text AND column_name = $2::text",
                &[&table, &column],
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!(
                    "failed to read type of {table}.{column}: {e}"
                ))
            })?;
        row.map(|row| row.try_get(0))
            .transpose()
            .map_err(|e| {
                Error::SchemaIntrospection(format!(
                    "failed to read type of {table}.{column}: {e}"
                ))
            })
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .client
            .query(
                "SELECT c.column_name::text,
                        c.data_type::text,
                        c.is_nullable::text = 'NO',
                        c.column_default::text,
                        EXISTS (
                            SELECT 1
                            FROM information_schema.table_constraints tc
                            JOIN information_schema.key_column_usage kcu
                              ON kcu.constraint_name = tc.constraint_name
                             AND kcu.table_schema = tc.table_schema
                             AND kcu.table_name = tc.table_name
                            WHERE tc.constraint_type = 'PRIMARY KEY'
                              AND tc.table_schema = c.table_schema
                              AND tc.table_name = c.table_name
                              AND kcu.column_name = c.column_name
                        )
                 FROM information_schema.columns c
                 WHERE c.table_schema = current_schema() AND c.table_name = $1::text
                 ORDER BY c.ordinal_position",
                &[&table],
            )
            .map_err(|e| {
                Error::SchemaIntrospection(format!("failed to list columns of {table}: {e}"))
            })?;

        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get(0)?,
                    declared_type: row.try_get(1)?,
                    not_null: row.try_get(2)?,
                    default: row.try_get(3)?,
                    primary_key: row.try_get(4)?,
                })
            })
            .collect::<std::result::Result<Vec<_>, postgres::Error>>()
            .map_err(|e| Error::SchemaIntrospection(format!("failed to read column row: {e}")))
    }
}
