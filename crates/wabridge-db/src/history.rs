use chrono::{NaiveDateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wabridge_common::{Error, Result};

use crate::capabilities::SchemaCapabilities;
use crate::database::{Database, SchemaTx};

/// Table owned by the messaging library that keys decryption secrets by
/// message id. Not created by any migration here.
pub const MESSAGE_SECRETS_TABLE: &str = "whatsmeow_message_secrets";

const INSERT_PG: &str = "INSERT INTO message_history
    (user_id, chat_jid, sender_jid, message_id, timestamp, message_type,
     text_content, media_link, quoted_message_id, datajson)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

const INSERT_SQLITE: &str = "INSERT INTO message_history
    (user_id, chat_jid, sender_jid, message_id, timestamp, message_type,
     text_content, media_link, quoted_message_id, datajson)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const RECENT_PG: &str = "SELECT id, user_id, chat_jid, sender_jid, message_id, timestamp,
        message_type, text_content, media_link, quoted_message_id, datajson
    FROM message_history
    WHERE user_id = $1 AND chat_jid = $2
    ORDER BY timestamp DESC
    LIMIT $3";

const RECENT_SQLITE: &str = "SELECT id, user_id, chat_jid, sender_jid, message_id, timestamp,
        message_type, text_content, media_link, quoted_message_id, datajson
    FROM message_history
    WHERE user_id = ?1 AND chat_jid = ?2
    ORDER BY timestamp DESC
    LIMIT ?3";

// Secrets go first: their subquery needs the history rows that are about to
// be deleted.
const TRIM_SECRETS_PG: &str = "DELETE FROM whatsmeow_message_secrets
    WHERE message_id IN (
        SELECT message_id FROM message_history
        WHERE user_id = $1 AND chat_jid = $2
        ORDER BY timestamp DESC
        OFFSET $3
    )";

const TRIM_HISTORY_PG: &str = "DELETE FROM message_history
    WHERE id IN (
        SELECT id FROM message_history
        WHERE user_id = $1 AND chat_jid = $2
        ORDER BY timestamp DESC
        OFFSET $3
    )";

const TRIM_SECRETS_SQLITE: &str = "DELETE FROM whatsmeow_message_secrets
    WHERE message_id IN (
        SELECT message_id FROM message_history
        WHERE user_id = ?1 AND chat_jid = ?2
        ORDER BY timestamp DESC
        LIMIT -1 OFFSET ?3
    )";

const TRIM_HISTORY_SQLITE: &str = "DELETE FROM message_history
    WHERE id IN (
        SELECT id FROM message_history
        WHERE user_id = ?1 AND chat_jid = ?2
        ORDER BY timestamp DESC
        LIMIT -1 OFFSET ?3
    )";

/// A message to be written to the history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewHistoryMessage {
    pub user_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    pub message_id: String,
    pub message_type: String,
    pub text_content: String,
    pub media_link: String,
    pub quoted_message_id: Option<String>,
    pub data_json: Option<String>,
}

/// A stored history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: i64,
    pub user_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    pub message_id: String,
    pub timestamp: NaiveDateTime,
    pub message_type: String,
    pub text_content: Option<String>,
    pub media_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<String>,
    pub data_json: Option<String>,
}

/// Rows removed by [`MessageHistory::trim`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimOutcome {
    pub messages: u64,
    pub secrets: u64,
}

/// Per-chat message history stored in `message_history`.
pub struct MessageHistory<'a> {
    db: &'a mut Database,
}

impl<'a> MessageHistory<'a> {
    pub fn new(db: &'a mut Database) -> Self {
        Self { db }
    }

    pub fn save(&mut self, msg: &NewHistoryMessage) -> Result<()> {
        self.save_at(msg, Utc::now().naive_utc())
    }

    pub fn save_at(&mut self, msg: &NewHistoryMessage, timestamp: NaiveDateTime) -> Result<()> {
        let result = match &mut *self.db {
            Database::Network(client) => client
                .execute(
                    INSERT_PG,
                    &[
                        &msg.user_id,
                        &msg.chat_jid,
                        &msg.sender_jid,
                        &msg.message_id,
                        &timestamp,
                        &msg.message_type,
                        &msg.text_content,
                        &msg.media_link,
                        &msg.quoted_message_id,
                        &msg.data_json,
                    ],
                )
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Database::Embedded(conn) => conn
                .execute(
                    INSERT_SQLITE,
                    params![
                        msg.user_id,
                        msg.chat_jid,
                        msg.sender_jid,
                        msg.message_id,
                        timestamp,
                        msg.message_type,
                        msg.text_content,
                        msg.media_link,
                        msg.quoted_message_id,
                        msg.data_json,
                    ],
                )
                .map(|_| ())
                .map_err(|e| e.to_string()),
        };
        result.map_err(|e| Error::Database(format!("failed to save message to history: {e}")))
    }

    /// Up to `limit` messages of one chat, newest first.
    pub fn recent(
        &mut self,
        user_id: &str,
        chat_jid: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match &mut *self.db {
            Database::Network(client) => {
                let rows = client
                    .query(RECENT_PG, &[&user_id, &chat_jid, &limit])
                    .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;
                rows.iter()
                    .map(|row| {
                        Ok(HistoryMessage {
                            id: i64::from(row.try_get::<_, i32>(0)?),
                            user_id: row.try_get(1)?,
                            chat_jid: row.try_get(2)?,
                            sender_jid: row.try_get(3)?,
                            message_id: row.try_get(4)?,
                            timestamp: row.try_get(5)?,
                            message_type: row.try_get(6)?,
                            text_content: row.try_get(7)?,
                            media_link: row.try_get(8)?,
                            quoted_message_id: row.try_get(9)?,
                            data_json: row.try_get(10)?,
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, postgres::Error>>()
                    .map_err(|e| Error::Database(format!("failed to read history row: {e}")))
            }
            Database::Embedded(conn) => {
                let mut stmt = conn
                    .prepare(RECENT_SQLITE)
                    .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
                let rows = stmt
                    .query_map(params![user_id, chat_jid, limit], |row| {
                        Ok(HistoryMessage {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            chat_jid: row.get(2)?,
                            sender_jid: row.get(3)?,
                            message_id: row.get(4)?,
                            timestamp: row.get(5)?,
                            message_type: row.get(6)?,
                            text_content: row.get(7)?,
                            media_link: row.get(8)?,
                            quoted_message_id: row.get(9)?,
                            data_json: row.get(10)?,
                        })
                    })
                    .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;

                let mut messages = Vec::new();
                for row in rows {
                    messages.push(
                        row.map_err(|e| {
                            Error::Database(format!("failed to read history row: {e}"))
                        })?,
                    );
                }
                Ok(messages)
            }
        }
    }

    /// Keep the newest `limit` messages of one chat and delete the rest,
    /// together with their entries in the secrets table when it exists.
    pub fn trim(&mut self, user_id: &str, chat_jid: &str, limit: usize) -> Result<TrimOutcome> {
        let offset = i64::try_from(limit).unwrap_or(i64::MAX);

        let outcome = self.db.transaction(|tx| {
            let has_secrets = tx.table_exists(MESSAGE_SECRETS_TABLE)?;
            if !has_secrets {
                debug!("{MESSAGE_SECRETS_TABLE} does not exist, trimming history only");
            }

            let (secrets, messages) = match tx {
                SchemaTx::Network(tx) => {
                    let args: [&(dyn postgres::types::ToSql + Sync); 3] =
                        [&user_id, &chat_jid, &offset];
                    let secrets = if has_secrets {
                        tx.execute(TRIM_SECRETS_PG, &args).map_err(|e| trim_error("secrets", &e))?
                    } else {
                        0
                    };
                    let messages = tx
                        .execute(TRIM_HISTORY_PG, &args)
                        .map_err(|e| trim_error("history", &e))?;
                    (secrets, messages)
                }
                SchemaTx::Embedded(tx) => {
                    let secrets = if has_secrets {
                        tx.execute(TRIM_SECRETS_SQLITE, params![user_id, chat_jid, offset])
                            .map_err(|e| trim_error("secrets", &e))? as u64
                    } else {
                        0
                    };
                    let messages = tx
                        .execute(TRIM_HISTORY_SQLITE, params![user_id, chat_jid, offset])
                        .map_err(|e| trim_error("history", &e))? as u64;
                    (secrets, messages)
                }
            };
            Ok(TrimOutcome { messages, secrets })
        })?;

        debug!(
            "trimmed {} messages and {} secrets for {user_id}/{chat_jid}",
            outcome.messages, outcome.secrets
        );
        Ok(outcome)
    }
}

fn trim_error(what: &str, e: &dyn std::fmt::Display) -> Error {
    Error::Database(format!("failed to trim message {what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::Migrator;
    use crate::registry::Registry;
    use chrono::{Duration, NaiveDate};

    fn migrated() -> Database {
        let mut db = Database::in_memory().unwrap();
        Migrator::new(Registry::builtin()).apply_all(&mut db).unwrap();
        db
    }

    fn message(n: usize) -> NewHistoryMessage {
        NewHistoryMessage {
            user_id: "u1".into(),
            chat_jid: "c1@s.whatsapp.net".into(),
            sender_jid: "s@s.whatsapp.net".into(),
            message_id: format!("m{n}"),
            message_type: "text".into(),
            text_content: format!("hello {n}"),
            ..Default::default()
        }
    }

    fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    #[test]
    fn save_and_read_recent_newest_first() {
        let mut db = migrated();
        let mut history = db.history();
        for n in 0..3 {
            history
                .save_at(&message(n), base_time() + Duration::minutes(n as i64))
                .unwrap();
        }

        let recent = history.recent("u1", "c1@s.whatsapp.net", 2).unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(recent[0].timestamp, base_time() + Duration::minutes(2));
        assert_eq!(recent[0].text_content.as_deref(), Some("hello 2"));
        assert_eq!(recent[0].media_link.as_deref(), Some(""));
        assert!(recent[0].quoted_message_id.is_none());
    }

    #[test]
    fn save_uses_current_time() {
        let mut db = migrated();
        let before = Utc::now().naive_utc();
        db.history().save(&message(0)).unwrap();

        let stored = db.history().recent("u1", "c1@s.whatsapp.net", 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].timestamp >= before - Duration::seconds(1));
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let mut db = migrated();
        let mut history = db.history();
        history.save(&message(0)).unwrap();
        assert!(matches!(history.save(&message(0)), Err(Error::Database(_))));
    }

    #[test]
    fn trim_without_secrets_table() {
        let mut db = migrated();
        let mut history = db.history();
        for n in 0..5 {
            history
                .save_at(&message(n), base_time() + Duration::minutes(n as i64))
                .unwrap();
        }

        let outcome = history.trim("u1", "c1@s.whatsapp.net", 2).unwrap();
        assert_eq!(
            outcome,
            TrimOutcome {
                messages: 3,
                secrets: 0
            }
        );
        assert_eq!(history.recent("u1", "c1@s.whatsapp.net", 10).unwrap().len(), 2);
    }

    #[test]
    fn history_message_serializes_without_missing_quote() {
        let msg = HistoryMessage {
            id: 1,
            user_id: "u1".into(),
            chat_jid: "c1".into(),
            sender_jid: "s1".into(),
            message_id: "m1".into(),
            timestamp: base_time(),
            message_type: "text".into(),
            text_content: Some("hi".into()),
            media_link: None,
            quoted_message_id: None,
            data_json: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("quoted_message_id").is_none());
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00");
    }
}
