//! Column type changes for SQLite.
//!
//! SQLite has no `ALTER COLUMN`, so changing a column's type means building a
//! shadow table with the new definition, copying every row across, dropping
//! the original and renaming the shadow into place. Every row gets a fresh
//! random id in the changed column. Primary key, unique and foreign key
//! constraints are repeated on the shadow table; a table with a `CHECK` clause
//! or a generated column is refused.
//!
//! Runs on the caller's transaction. Nothing here commits, so a failure at any
//! step leaves the original table untouched once the caller rolls back.

use rusqlite::{Connection, params};
use tracing::{debug, info};
use wabridge_common::{Error, Result};

use crate::capabilities::{ColumnInfo, SchemaCapabilities, SqliteCatalog};
use crate::ids::generate_random_id;

/// Change `table.column` to `new_type`, re-keying every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildTable {
    pub table: &'static str,
    pub column: &'static str,
    pub new_type: &'static str,
}

impl RebuildTable {
    pub fn shadow_name(&self) -> String {
        format!("{}_rebuild", self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Column absent or already of the target type.
    Unchanged,
    Rebuilt { rows: usize },
}

/// Rebuild `change.table` so that `change.column` has type `change.new_type`.
///
/// Column types, `NOT NULL`, defaults, key and foreign key constraints are
/// preserved, as are explicitly created indexes.
pub fn rebuild_table(conn: &Connection, change: &RebuildTable) -> Result<RebuildOutcome> {
    let mut catalog = SqliteCatalog::new(conn);

    let Some(current) = catalog.column_type(change.table, change.column)? else {
        debug!(
            "{}.{} does not exist, nothing to rebuild",
            change.table, change.column
        );
        return Ok(RebuildOutcome::Unchanged);
    };
    if current.eq_ignore_ascii_case(change.new_type) {
        debug!(
            "{}.{} is already {}, nothing to rebuild",
            change.table, change.column, change.new_type
        );
        return Ok(RebuildOutcome::Unchanged);
    }

    let constraints = TableConstraints::read(conn, change.table)?;
    let columns = catalog.table_columns(change.table)?;
    let indexes = index_definitions(conn, change.table)?;
    let shadow = change.shadow_name();

    exec(
        conn,
        &shadow_ddl(change, &shadow, &columns, &constraints),
        "create shadow table",
    )?;
    let rows = copy_rows(conn, change, &shadow, &columns)?;
    exec(
        conn,
        &format!("DROP TABLE {}", quote_ident(change.table)),
        "drop original table",
    )?;
    exec(
        conn,
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&shadow),
            quote_ident(change.table)
        ),
        "rename shadow table",
    )?;
    for index in &indexes {
        exec(conn, index, "recreate index")?;
    }

    info!(
        "rebuilt {} with {} as {} ({} rows, was {})",
        change.table, change.column, change.new_type, rows, current
    );
    Ok(RebuildOutcome::Rebuilt { rows })
}

/// Table clauses the shadow table has to repeat.
#[derive(Debug, Default)]
struct TableConstraints {
    /// Primary key columns in key order.
    primary_key: Vec<String>,
    autoincrement: bool,
    unique: Vec<Vec<String>>,
    foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    columns: Vec<String>,
    parent: String,
    /// Empty when the parent's primary key is referenced implicitly.
    parent_columns: Vec<String>,
    on_update: String,
    on_delete: String,
}

/// Clauses the catalog pragmas cannot describe.
const UNSUPPORTED_CLAUSES: [&str; 2] = ["CHECK", "GENERATED"];

impl TableConstraints {
    fn read(conn: &Connection, table: &str) -> Result<Self> {
        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| introspection(&format!("read definition of {table}"), e))?;
        if let Some(clause) = UNSUPPORTED_CLAUSES
            .iter()
            .find(|clause| contains_keyword(&sql, clause))
        {
            return Err(Error::MigrationExecution(format!(
                "table rebuild cannot reproduce the {clause} clause of {table}"
            )));
        }

        let primary_key = string_column(
            conn,
            "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
            table,
        )?;
        let unique = string_column(
            conn,
            "SELECT name FROM pragma_index_list(?1) WHERE origin = 'u' ORDER BY name",
            table,
        )?
        .iter()
        .map(|index| {
            string_column(
                conn,
                "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
                index,
            )
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            primary_key,
            autoincrement: contains_keyword(&sql, "AUTOINCREMENT"),
            unique,
            foreign_keys: foreign_keys(conn, table)?,
        })
    }
}

fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )
        .map_err(|e| introspection("list foreign keys", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|e| introspection("list foreign keys", e))?;

    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for row in rows {
        let (id, parent, from, to, on_update, on_delete) =
            row.map_err(|e| introspection("read foreign key row", e))?;
        match keys.last_mut() {
            Some((last, key)) if *last == id => {
                key.columns.push(from);
                key.parent_columns.extend(to);
            }
            _ => keys.push((
                id,
                ForeignKey {
                    columns: vec![from],
                    parent,
                    parent_columns: to.into_iter().collect(),
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, key)| key).collect())
}

fn string_column(conn: &Connection, sql: &str, arg: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| introspection("prepare catalog query", e))?;
    let rows = stmt
        .query_map(params![arg], |row| row.get::<_, String>(0))
        .map_err(|e| introspection("run catalog query", e))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| introspection("read catalog row", e))
}

/// Whether `keyword` occurs as a bare word in `sql`, outside string literals
/// and quoted identifiers.
fn contains_keyword(sql: &str, keyword: &str) -> bool {
    let mut word = String::new();
    let mut chars = sql.chars();
    while let Some(c) = chars.next() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        if word.eq_ignore_ascii_case(keyword) {
            return true;
        }
        word.clear();
        let close = match c {
            '\'' | '"' | '`' => c,
            '[' => ']',
            _ => continue,
        };
        for quoted in chars.by_ref() {
            if quoted == close {
                break;
            }
        }
    }
    word.eq_ignore_ascii_case(keyword)
}

fn shadow_ddl(
    change: &RebuildTable,
    shadow: &str,
    columns: &[ColumnInfo],
    constraints: &TableConstraints,
) -> String {
    let inline_key = match constraints.primary_key.as_slice() {
        [only] => Some(only.as_str()),
        _ => None,
    };

    let mut defs: Vec<String> = columns
        .iter()
        .map(|col| {
            let changed = col.name == change.column;
            let mut def = quote_ident(&col.name);
            let declared = if changed {
                change.new_type
            } else {
                col.declared_type.as_str()
            };
            if !declared.is_empty() {
                def.push(' ');
                def.push_str(declared);
            }
            if inline_key == Some(col.name.as_str()) {
                def.push_str(" PRIMARY KEY");
                if constraints.autoincrement && !changed {
                    def.push_str(" AUTOINCREMENT");
                }
            }
            // Every row gets an id, so a re-keyed key column can never be null.
            if col.not_null || (changed && col.primary_key) {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = &col.default {
                def.push_str(&format!(" DEFAULT ({default})"));
            }
            def
        })
        .collect();

    if constraints.primary_key.len() > 1 {
        defs.push(format!("PRIMARY KEY ({})", ident_list(&constraints.primary_key)));
    }
    for unique in &constraints.unique {
        defs.push(format!("UNIQUE ({})", ident_list(unique)));
    }
    for key in &constraints.foreign_keys {
        let mut def = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            ident_list(&key.columns),
            quote_ident(&key.parent)
        );
        if !key.parent_columns.is_empty() {
            def.push_str(&format!(" ({})", ident_list(&key.parent_columns)));
        }
        if key.on_update != "NO ACTION" {
            def.push_str(&format!(" ON UPDATE {}", key.on_update));
        }
        if key.on_delete != "NO ACTION" {
            def.push_str(&format!(" ON DELETE {}", key.on_delete));
        }
        defs.push(def);
    }

    format!("CREATE TABLE {} ({})", quote_ident(shadow), defs.join(", "))
}

/// Copy rows one at a time so each gets its own id.
fn copy_rows(
    conn: &Connection,
    change: &RebuildTable,
    shadow: &str,
    columns: &[ColumnInfo],
) -> Result<usize> {
    let others: Vec<String> = columns
        .iter()
        .filter(|col| col.name != change.column)
        .map(|col| quote_ident(&col.name))
        .collect();

    let rowids = {
        let mut stmt = conn
            .prepare(&format!("SELECT rowid FROM {}", quote_ident(change.table)))
            .map_err(|e| execution("read row ids", e))?;
        stmt.query_map([], |row| row.get::<_, i64>(0))
            .map_err(|e| execution("read row ids", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| execution("read row ids", e))?
    };

    let target = quote_ident(change.column);
    let sql = if others.is_empty() {
        format!("INSERT INTO {} ({target}) VALUES (?1)", quote_ident(shadow))
    } else {
        let list = others.join(", ");
        format!(
            "INSERT INTO {} ({target}, {list}) SELECT ?1, {list} FROM {} WHERE rowid = ?2",
            quote_ident(shadow),
            quote_ident(change.table)
        )
    };
    let mut insert = conn.prepare(&sql).map_err(|e| execution("prepare row copy", e))?;

    for rowid in &rowids {
        let id = generate_random_id();
        let copied = if others.is_empty() {
            insert.execute(params![id])
        } else {
            insert.execute(params![id, rowid])
        };
        copied.map_err(|e| execution("copy row", e))?;
    }
    Ok(rowids.len())
}

/// `CREATE INDEX` statements for indexes created explicitly on `table`.
/// Automatic indexes backing constraints have no SQL and are skipped.
fn index_definitions(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT sql FROM sqlite_master
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL",
        )
        .map_err(|e| introspection("list indexes", e))?;
    let rows = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .map_err(|e| introspection("list indexes", e))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| introspection("read index row", e))
}

fn exec(conn: &Connection, sql: &str, step: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| execution(step, e))
}

fn execution(step: &str, e: rusqlite::Error) -> Error {
    Error::MigrationExecution(format!("table rebuild failed to {step}: {e}"))
}

fn introspection(step: &str, e: rusqlite::Error) -> Error {
    Error::SchemaIntrospection(format!("table rebuild failed to {step}: {e}"))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn ident_list(idents: &[String]) -> String {
    idents
        .iter()
        .map(|ident| quote_ident(ident))
        .collect::<Vec<_>>()
        .join(", ")
}
