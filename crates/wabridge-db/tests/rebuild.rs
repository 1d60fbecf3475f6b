use std::collections::HashSet;

use rusqlite::{Connection, params};
use wabridge_db::capabilities::SqliteCatalog;
use wabridge_db::rebuild::rebuild_table;
use wabridge_db::{Database, Migrator, RebuildOutcome, RebuildTable, Registry, SchemaCapabilities};

/// `users` as it looked before ids became strings.
const LEGACY_USERS: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    token TEXT NOT NULL,
    webhook TEXT NOT NULL DEFAULT '',
    jid TEXT NOT NULL DEFAULT '',
    qrcode TEXT NOT NULL DEFAULT '',
    connected INTEGER,
    expiration INTEGER,
    events TEXT NOT NULL DEFAULT ''
)";

type UserRow = (String, String, String, String, Option<i64>, Option<i64>, String);

fn seed_legacy_users(conn: &Connection, count: usize) {
    conn.execute_batch(LEGACY_USERS).unwrap();
    for n in 0..count {
        let connected = if n % 3 == 0 { None } else { Some((n % 2) as i64) };
        conn.execute(
            "INSERT INTO users (name, token, webhook, jid, connected, expiration, events)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                // Duplicate names on purpose: rows are compared as a multiset.
                format!("user{}", n % 7),
                format!("token-{n}"),
                if n % 2 == 0 { "https://hooks.example/in".to_string() } else { String::new() },
                format!("{n}@s.whatsapp.net"),
                connected,
                (n * 1000) as i64,
                "Message,ReadReceipt",
            ],
        )
        .unwrap();
    }
}

fn user_rows(conn: &Connection) -> Vec<UserRow> {
    let mut rows: Vec<UserRow> = conn
        .prepare("SELECT name, token, webhook, jid, connected, expiration, events FROM users")
        .unwrap()
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    rows.sort();
    rows
}

fn user_ids(conn: &Connection) -> Vec<String> {
    conn.prepare("SELECT id FROM users")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn assert_fresh_hex_ids(ids: &[String]) {
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "ids are not unique");
    for id in ids {
        assert_eq!(id.len(), 32, "{id} is not 32 characters");
        assert!(
            id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')),
            "{id} is not lowercase hex"
        );
    }
}

#[test]
fn rebuild_preserves_rows_and_rekeys() {
    let tmp = tempfile::tempdir().unwrap();
    let mut conn = Connection::open(tmp.path().join("users.db")).unwrap();
    seed_legacy_users(&conn, 40);
    let before = user_rows(&conn);

    let tx = conn.transaction().unwrap();
    let outcome = rebuild_table(
        &tx,
        &RebuildTable {
            table: "users",
            column: "id",
            new_type: "TEXT",
        },
    )
    .unwrap();
    tx.commit().unwrap();

    assert_eq!(outcome, RebuildOutcome::Rebuilt { rows: 40 });
    assert_eq!(user_rows(&conn), before);
    assert_fresh_hex_ids(&user_ids(&conn));

    let mut catalog = SqliteCatalog::new(&conn);
    let columns = catalog.table_columns("users").unwrap();
    let id = columns.iter().find(|c| c.name == "id").unwrap();
    assert_eq!(id.declared_type, "TEXT");
    assert!(id.primary_key);
    let webhook = columns.iter().find(|c| c.name == "webhook").unwrap();
    assert!(webhook.not_null);
    assert!(webhook.default.is_some());
    assert!(!catalog.table_exists("users_rebuild").unwrap());
}

#[test]
fn rebuild_rolls_back_with_its_transaction() {
    let mut conn = Connection::open_in_memory().unwrap();
    seed_legacy_users(&conn, 5);

    let tx = conn.transaction().unwrap();
    rebuild_table(
        &tx,
        &RebuildTable {
            table: "users",
            column: "id",
            new_type: "TEXT",
        },
    )
    .unwrap();
    tx.rollback().unwrap();

    let mut catalog = SqliteCatalog::new(&conn);
    assert_eq!(
        catalog.column_type("users", "id").unwrap().as_deref(),
        Some("INTEGER")
    );
    let ids: Vec<i64> = conn
        .prepare("SELECT id FROM users ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[test]
fn legacy_database_migrates_to_string_ids() {
    let mut db = Database::in_memory().unwrap();
    let Database::Embedded(conn) = &db else {
        panic!("in-memory database is embedded");
    };
    seed_legacy_users(conn, 12);
    let before = user_rows(conn);

    let report = Migrator::new(Registry::builtin()).apply_all(&mut db).unwrap();
    assert_eq!(report.applied, (1..=9).collect::<Vec<_>>());

    let Database::Embedded(conn) = &db else {
        unreachable!();
    };
    assert_eq!(user_rows(conn), before);
    assert_fresh_hex_ids(&user_ids(conn));

    let proxies: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE proxy_url = ''",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(proxies, 12);

    assert_eq!(
        db.capabilities().column_type("users", "id").unwrap().as_deref(),
        Some("TEXT")
    );
    assert!(
        db.capabilities()
            .column_exists("users", "days_to_sync_history")
            .unwrap()
    );
}

fn rebuild(conn: &mut Connection, change: RebuildTable) -> wabridge_common::Result<RebuildOutcome> {
    let tx = conn.transaction().unwrap();
    let outcome = rebuild_table(&tx, &change)?;
    tx.commit().unwrap();
    Ok(outcome)
}

#[test]
fn rebuilding_a_non_key_column_keeps_the_primary_key() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE devices (id INTEGER PRIMARY KEY, code INTEGER, label TEXT);
         INSERT INTO devices (id, code, label) VALUES (1, 10, 'a'), (2, 20, 'b'), (3, 30, 'c');",
    )
    .unwrap();

    let outcome = rebuild(
        &mut conn,
        RebuildTable {
            table: "devices",
            column: "code",
            new_type: "TEXT",
        },
    )
    .unwrap();
    assert_eq!(outcome, RebuildOutcome::Rebuilt { rows: 3 });

    let columns = SqliteCatalog::new(&conn).table_columns("devices").unwrap();
    let id = columns.iter().find(|c| c.name == "id").unwrap();
    assert_eq!(id.declared_type, "INTEGER");
    assert!(id.primary_key);
    let code = columns.iter().find(|c| c.name == "code").unwrap();
    assert_eq!(code.declared_type, "TEXT");
    assert!(!code.primary_key);

    let rows: Vec<(i64, String)> = conn
        .prepare("SELECT id, label FROM devices ORDER BY id")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        rows,
        vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
    );
    let codes: Vec<String> = conn
        .prepare("SELECT code FROM devices")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_fresh_hex_ids(&codes);
}

#[test]
fn composite_primary_key_survives_rebuild() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE memberships (
            user_id INTEGER NOT NULL,
            group_id TEXT NOT NULL,
            PRIMARY KEY (user_id, group_id)
        );
        INSERT INTO memberships VALUES (1, 'g1'), (1, 'g2');",
    )
    .unwrap();

    rebuild(
        &mut conn,
        RebuildTable {
            table: "memberships",
            column: "user_id",
            new_type: "TEXT",
        },
    )
    .unwrap();

    let key: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('memberships') WHERE pk > 0 ORDER BY pk")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(key, vec!["user_id", "group_id"]);

    let user_id: String = conn
        .query_row(
            "SELECT user_id FROM memberships WHERE group_id = 'g1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let duplicate = conn.execute(
        "INSERT INTO memberships (user_id, group_id) VALUES (?1, 'g1')",
        params![user_id],
    );
    assert!(duplicate.is_err());
}

#[test]
fn unique_constraints_survive_rebuild() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, token TEXT NOT NULL, UNIQUE (token));
         INSERT INTO users (token) VALUES ('t1'), ('t2');",
    )
    .unwrap();

    rebuild(
        &mut conn,
        RebuildTable {
            table: "users",
            column: "id",
            new_type: "TEXT",
        },
    )
    .unwrap();

    let duplicate = conn.execute(
        "INSERT INTO users (id, token) VALUES ('fresh', 't1')",
        [],
    );
    assert!(duplicate.is_err(), "duplicate token was accepted");
    conn.execute("INSERT INTO users (id, token) VALUES ('fresh', 't3')", [])
        .unwrap();
}

#[test]
fn foreign_keys_survive_rebuild() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE chats (jid TEXT PRIMARY KEY);
         CREATE TABLE messages (
             id INTEGER PRIMARY KEY,
             chat_jid TEXT NOT NULL REFERENCES chats (jid) ON DELETE CASCADE,
             body TEXT
         );
         INSERT INTO chats VALUES ('c1'), ('c2');
         INSERT INTO messages (chat_jid, body) VALUES ('c1', 'hi'), ('c2', 'yo');",
    )
    .unwrap();

    rebuild(
        &mut conn,
        RebuildTable {
            table: "messages",
            column: "id",
            new_type: "TEXT",
        },
    )
    .unwrap();

    let key: (String, String, String, String) = conn
        .query_row(
            "SELECT \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list('messages')",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(
        key,
        (
            "chats".to_string(),
            "chat_jid".to_string(),
            "jid".to_string(),
            "CASCADE".to_string()
        )
    );

    let orphan = conn.execute(
        "INSERT INTO messages (id, chat_jid) VALUES ('x', 'missing')",
        [],
    );
    assert!(orphan.is_err(), "orphan row was accepted");

    conn.execute("DELETE FROM chats WHERE jid = 'c1'", []).unwrap();
    let left: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .unwrap();
    assert_eq!(left, 1);
}

#[test]
fn check_constraint_refuses_rebuild() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            expiration INTEGER CHECK (expiration >= 0)
        );
        INSERT INTO users (expiration) VALUES (5);",
    )
    .unwrap();

    let err = rebuild(
        &mut conn,
        RebuildTable {
            table: "users",
            column: "id",
            new_type: "TEXT",
        },
    )
    .unwrap_err();
    assert!(matches!(err, wabridge_common::Error::MigrationExecution(_)));
    assert_eq!(
        SqliteCatalog::new(&conn)
            .column_type("users", "id")
            .unwrap()
            .as_deref(),
        Some("INTEGER")
    );
}
