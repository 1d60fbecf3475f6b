//! The schema history of the service, oldest first. Append only: once a
//! migration has shipped its id, name and effects never change.

use crate::operations::EmbeddedOp;
use crate::rebuild::RebuildTable;
use crate::registry::MigrationDefinition;

pub fn migrations() -> Vec<MigrationDefinition> {
    vec![
        MigrationDefinition {
            id: 1,
            name: "initial_schema",
            network: INITIAL_SCHEMA_PG,
            embedded: vec![EmbeddedOp::CreateTable {
                table: "users",
                ddl: INITIAL_SCHEMA_SQLITE,
            }],
        },
        MigrationDefinition {
            id: 2,
            name: "add_proxy_url",
            network: "ALTER TABLE users ADD COLUMN IF NOT EXISTS proxy_url TEXT DEFAULT '';",
            embedded: vec![add_column("users", "proxy_url", "TEXT DEFAULT ''")],
        },
        MigrationDefinition {
            id: 3,
            name: "change_id_to_string",
            network: CHANGE_ID_TO_STRING_PG,
            embedded: vec![EmbeddedOp::RebuildTable(RebuildTable {
                table: "users",
                column: "id",
                new_type: "TEXT",
            })],
        },
        MigrationDefinition {
            id: 4,
            name: "add_s3_support",
            network: ADD_S3_SUPPORT_PG,
            embedded: vec![
                add_column("users", "s3_enabled", "BOOLEAN DEFAULT 0"),
                add_column("users", "s3_endpoint", "TEXT DEFAULT ''"),
                add_column("users", "s3_region", "TEXT DEFAULT ''"),
                add_column("users", "s3_bucket", "TEXT DEFAULT ''"),
                add_column("users", "s3_access_key", "TEXT DEFAULT ''"),
                add_column("users", "s3_secret_key", "TEXT DEFAULT ''"),
                add_column("users", "s3_path_style", "BOOLEAN DEFAULT 1"),
                add_column("users", "s3_public_url", "TEXT DEFAULT ''"),
                add_column("users", "media_delivery", "TEXT DEFAULT 'base64'"),
                add_column("users", "s3_retention_days", "INTEGER DEFAULT 30"),
            ],
        },
        MigrationDefinition {
            id: 5,
            name: "add_message_history",
            network: ADD_MESSAGE_HISTORY_PG,
            embedded: vec![
                EmbeddedOp::CreateTable {
                    table: "message_history",
                    ddl: MESSAGE_HISTORY_SQLITE,
                },
                EmbeddedOp::Idempotent(
                    "CREATE INDEX IF NOT EXISTS idx_message_history_user_chat_timestamp
                     ON message_history (user_id, chat_jid, timestamp DESC)",
                ),
                add_column("users", "history", "INTEGER DEFAULT 0"),
            ],
        },
        MigrationDefinition {
            id: 6,
            name: "add_quoted_message_id",
            network: "ALTER TABLE message_history ADD COLUMN IF NOT EXISTS quoted_message_id TEXT;",
            embedded: vec![add_column("message_history", "quoted_message_id", "TEXT")],
        },
        MigrationDefinition {
            id: 7,
            name: "add_hmac_key",
            network: "ALTER TABLE users ADD COLUMN IF NOT EXISTS hmac_key BYTEA;",
            embedded: vec![add_column("users", "hmac_key", "BLOB")],
        },
        MigrationDefinition {
            id: 8,
            name: "add_data_json",
            network: "ALTER TABLE message_history ADD COLUMN IF NOT EXISTS datajson TEXT;",
            embedded: vec![add_column("message_history", "datajson", "TEXT")],
        },
        MigrationDefinition {
            id: 9,
            name: "add_days_to_sync_history",
            network: "ALTER TABLE users ADD COLUMN IF NOT EXISTS days_to_sync_history INTEGER DEFAULT 0;",
            embedded: vec![add_column("users", "days_to_sync_history", "INTEGER DEFAULT 0")],
        },
    ]
}

fn add_column(table: &'static str, column: &'static str, definition: &'static str) -> EmbeddedOp {
    EmbeddedOp::AddColumn {
        table,
        column,
        definition,
    }
}

const INITIAL_SCHEMA_PG: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    token TEXT NOT NULL,
    webhook TEXT NOT NULL DEFAULT '',
    jid TEXT NOT NULL DEFAULT '',
    qrcode TEXT NOT NULL DEFAULT '',
    connected INTEGER,
    expiration INTEGER,
    events TEXT NOT NULL DEFAULT '',
    proxy_url TEXT DEFAULT ''
);
";

const INITIAL_SCHEMA_SQLITE: &str = "
CREATE TABLE users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    token TEXT NOT NULL,
    webhook TEXT NOT NULL DEFAULT '',
    jid TEXT NOT NULL DEFAULT '',
    qrcode TEXT NOT NULL DEFAULT '',
    connected INTEGER,
    expiration INTEGER,
    events TEXT NOT NULL DEFAULT '',
    proxy_url TEXT DEFAULT ''
)
";

// Only databases created before ids became strings still have an integer id.
const CHANGE_ID_TO_STRING_PG: &str = "
DO $$
BEGIN
    IF EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = 'users' AND column_name = 'id' AND data_type = 'integer'
    ) THEN
        ALTER TABLE users ADD COLUMN new_id TEXT;
        UPDATE users SET new_id = md5(random()::text || id::text || clock_timestamp()::text);
        ALTER TABLE users DROP COLUMN id CASCADE;
        ALTER TABLE users RENAME COLUMN new_id TO id;
        ALTER TABLE users ALTER COLUMN id SET NOT NULL;
        ALTER TABLE users ADD PRIMARY KEY (id);
    END IF;
END $$;
";

const ADD_S3_SUPPORT_PG: &str = "
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_enabled BOOLEAN DEFAULT FALSE;
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_endpoint TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_region TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_bucket TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_access_key TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_secret_key TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_path_style BOOLEAN DEFAULT TRUE;
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_public_url TEXT DEFAULT '';
ALTER TABLE users ADD COLUMN IF NOT EXISTS media_delivery TEXT DEFAULT 'base64';
ALTER TABLE users ADD COLUMN IF NOT EXISTS s3_retention_days INTEGER DEFAULT 30;
";

const ADD_MESSAGE_HISTORY_PG: &str = "
CREATE TABLE IF NOT EXISTS message_history (
    id SERIAL PRIMARY KEY,
    user_id TEXT NOT NULL,
    chat_jid TEXT NOT NULL,
    sender_jid TEXT NOT NULL,
    message_id TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    message_type TEXT NOT NULL,
    text_content TEXT,
    media_link TEXT,
    UNIQUE(user_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_message_history_user_chat_timestamp
    ON message_history (user_id, chat_jid, timestamp DESC);
ALTER TABLE users ADD COLUMN IF NOT EXISTS history INTEGER DEFAULT 0;
";

const MESSAGE_HISTORY_SQLITE: &str = "
CREATE TABLE message_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    chat_jid TEXT NOT NULL,
    sender_jid TEXT NOT NULL,
    message_id TEXT NOT NULL,
    timestamp DATETIME NOT NULL,
    message_type TEXT NOT NULL,
    text_content TEXT,
    media_link TEXT,
    UNIQUE(user_id, message_id)
)
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let all = migrations();
        let mut names: Vec<_> = all.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }

    #[test]
    fn network_scripts_are_guarded() {
        for m in migrations() {
            let script = m.network.trim();
            if script.starts_with("DO $$") {
                assert!(script.contains("IF EXISTS"), "migration {} has no guard", m.id);
                continue;
            }
            for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                assert!(
                    statement.contains("IF NOT EXISTS"),
                    "migration {} has an unguarded statement: {statement}",
                    m.id
                );
            }
        }
    }
}
