//! SQLite store for threads, connection records and checkpoints.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; calls are short and
//! made from the turn task between model and tool awaits. WAL mode is enabled
//! so the CLI and a running server can share the file.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::store::{CheckpointStore, ThreadStore};
use super::types::{Checkpoint, Thread};
use crate::connections::{ConnectionError, ConnectionStore, DbType, EncryptedSecret, UserConnection};

// ─── Database ───────────────────────────────────────────────────────────────

/// Durable implementation of every store trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        tracing::debug!(path, "store opened");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|_| AgentError::StorageError {
            reason: "store connection lock poisoned".into(),
        })
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                owner_id INTEGER NOT NULL,
                model_name TEXT,
                connection_ref TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_threads_owner ON threads(owner_id);

            CREATE TABLE IF NOT EXISTS user_connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                db_type TEXT NOT NULL,
                host TEXT,
                port INTEGER,
                username TEXT,
                database_name TEXT,
                secret_iv BLOB,
                secret_ciphertext BLOB,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_connections_owner ON user_connections(owner_id);

            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                round INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (thread_id) REFERENCES threads(id)
            );
            ",
        )?;
        Ok(())
    }
}

// ─── Threads ────────────────────────────────────────────────────────────────

impl ThreadStore for SqliteStore {
    fn create_thread(&self, thread: &Thread) -> Result<(), AgentError> {
        let refs = serde_json::to_string(&thread.connection_ref)?;
        self.lock()?.execute(
            "INSERT INTO threads (id, owner_id, model_name, connection_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread.id,
                thread.owner_id,
                thread.model_name,
                refs,
                thread.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, owner_id, model_name, connection_ref, created_at
                 FROM threads WHERE id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, owner_id, model_name, refs, created_at)) => Ok(Some(Thread {
                id,
                owner_id,
                model_name,
                connection_ref: serde_json::from_str(&refs)?,
                created_at: parse_timestamp(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    fn update_thread(&self, thread: &Thread) -> Result<(), AgentError> {
        let refs = serde_json::to_string(&thread.connection_ref)?;
        let changed = self.lock()?.execute(
            "UPDATE threads SET model_name = ?2, connection_ref = ?3 WHERE id = ?1",
            params![thread.id, thread.model_name, refs],
        )?;
        if changed == 0 {
            return Err(AgentError::ThreadNotFound {
                thread_id: thread.id.clone(),
            });
        }
        Ok(())
    }
}

// ─── Checkpoints ────────────────────────────────────────────────────────────

impl CheckpointStore for SqliteStore {
    fn load_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT phase, round, state, updated_at FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((phase, round, state, updated_at)) => Ok(Some(Checkpoint {
                thread_id: thread_id.to_string(),
                phase: serde_json::from_str(&phase)?,
                round,
                state: serde_json::from_str(&state)?,
                updated_at: parse_timestamp(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let phase = serde_json::to_string(&checkpoint.phase)?;
        let state = serde_json::to_string(&checkpoint.state)?;
        self.lock()?.execute(
            "INSERT INTO checkpoints (thread_id, phase, round, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(thread_id) DO UPDATE SET
                phase = excluded.phase,
                round = excluded.round,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![
                checkpoint.thread_id,
                phase,
                checkpoint.round,
                state,
                checkpoint.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

// ─── Connection records ─────────────────────────────────────────────────────

fn storage_error(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Storage {
        reason: e.to_string(),
    }
}

const CONNECTION_COLUMNS: &str = "id, owner_id, name, db_type, host, port, username, database_name,
     secret_iv, secret_ciphertext, updated_at";

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConnection> {
    Ok(RawConnection {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        db_type: row.get(3)?,
        host: row.get(4)?,
        port: row.get(5)?,
        username: row.get(6)?,
        database_name: row.get(7)?,
        secret_iv: row.get(8)?,
        secret_ciphertext: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Row as read, before the typed fields are validated.
struct RawConnection {
    id: i64,
    owner_id: i64,
    name: String,
    db_type: String,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    database_name: Option<String>,
    secret_iv: Option<Vec<u8>>,
    secret_ciphertext: Option<Vec<u8>>,
    updated_at: String,
}

impl RawConnection {
    fn into_record(self) -> Result<UserConnection, ConnectionError> {
        let secret = match (self.secret_iv, self.secret_ciphertext) {
            (Some(iv), Some(ciphertext)) => Some(EncryptedSecret { iv, ciphertext }),
            (None, None) => None,
            _ => {
                return Err(ConnectionError::InvalidRecord {
                    reason: format!("connection {} has a partial secret", self.id),
                })
            }
        };
        Ok(UserConnection {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            db_type: self.db_type.parse::<DbType>()?,
            host: self.host,
            port: self.port,
            username: self.username,
            database_name: self.database_name,
            secret,
            updated_at: DateTime::parse_from_rfc3339(&self.updated_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(storage_error)?,
        })
    }
}

impl ConnectionStore for SqliteStore {
    fn get_connection(
        &self,
        owner_id: i64,
        connection_id: i64,
    ) -> Result<Option<UserConnection>, ConnectionError> {
        let conn = self.conn.lock().map_err(storage_error)?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM user_connections
                     WHERE id = ?1 AND owner_id = ?2"
                ),
                params![connection_id, owner_id],
                row_to_connection,
            )
            .optional()
            .map_err(storage_error)?;
        raw.map(RawConnection::into_record).transpose()
    }

    fn list_connections(&self, owner_id: i64) -> Result<Vec<UserConnection>, ConnectionError> {
        let conn = self.conn.lock().map_err(storage_error)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM user_connections
                 WHERE owner_id = ?1 ORDER BY id ASC"
            ))
            .map_err(storage_error)?;
        let rows = stmt
            .query_map(params![owner_id], row_to_connection)
            .map_err(storage_error)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(storage_error)?.into_record()?);
        }
        Ok(records)
    }

    fn insert_connection(&self, mut record: UserConnection) -> Result<UserConnection, ConnectionError> {
        let conn = self.conn.lock().map_err(storage_error)?;
        let (iv, ciphertext) = match record.secret {
            Some(ref s) => (Some(s.iv.clone()), Some(s.ciphertext.clone())),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO user_connections
             (owner_id, name, db_type, host, port, username, database_name,
              secret_iv, secret_ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.owner_id,
                record.name,
                record.db_type.as_str(),
                record.host,
                record.port,
                record.username,
                record.database_name,
                iv,
                ciphertext,
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(storage_error)?;
        record.id = conn.last_insert_rowid();
        Ok(record)
    }

    fn update_connection(&self, record: &UserConnection) -> Result<(), ConnectionError> {
        let conn = self.conn.lock().map_err(storage_error)?;
        let (iv, ciphertext) = match record.secret {
            Some(ref s) => (Some(s.iv.clone()), Some(s.ciphertext.clone())),
            None => (None, None),
        };
        let changed = conn
            .execute(
                "UPDATE user_connections SET
                    name = ?3, db_type = ?4, host = ?5, port = ?6, username = ?7,
                    database_name = ?8, secret_iv = ?9, secret_ciphertext = ?10,
                    updated_at = ?11
                 WHERE id = ?1 AND owner_id = ?2",
                params![
                    record.id,
                    record.owner_id,
                    record.name,
                    record.db_type.as_str(),
                    record.host,
                    record.port,
                    record.username,
                    record.database_name,
                    iv,
                    ciphertext,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(storage_error)?;
        if changed == 0 {
            return Err(ConnectionError::NotFound {
                owner_id: record.owner_id,
                connection_id: record.id,
            });
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AgentError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentError::StorageError {
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::{Message, TurnPhase};
    use crate::connections::SecretCipher;

    fn test_db() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    fn record(owner_id: i64, cipher: &SecretCipher) -> UserConnection {
        UserConnection {
            id: 0,
            owner_id,
            name: "warehouse".into(),
            db_type: DbType::Postgres,
            host: Some("db.internal".into()),
            port: Some(5432),
            username: Some("analyst".into()),
            database_name: Some("sales".into()),
            secret: Some(cipher.encrypt("hunter2").unwrap()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_thread_roundtrip() {
        let db = test_db();
        let mut thread = Thread::new(7);
        db.create_thread(&thread).unwrap();

        thread.model_name = Some("gpt-oss-20b".into());
        thread.connection_ref = vec![3, 1];
        db.update_thread(&thread).unwrap();

        let loaded = db.get_thread(&thread.id).unwrap().unwrap();
        assert_eq!(loaded.owner_id, 7);
        assert_eq!(loaded.model_name.as_deref(), Some("gpt-oss-20b"));
        assert_eq!(loaded.connection_ref, vec![3, 1]);
    }

    #[test]
    fn test_thread_not_found() {
        let db = test_db();
        assert!(db.get_thread("nope").unwrap().is_none());
        assert!(matches!(
            db.update_thread(&Thread::new(1)),
            Err(AgentError::ThreadNotFound { .. })
        ));
    }

    #[test]
    fn test_checkpoint_upsert() {
        let db = test_db();
        let thread = Thread::new(1);
        db.create_thread(&thread).unwrap();

        let mut cp = Checkpoint::new(&thread.id);
        cp.state.messages.push(Message::user("how many leads?"));
        cp.phase = TurnPhase::Assistant;
        db.save_checkpoint(&cp).unwrap();

        cp.phase = TurnPhase::Tools { next: 0 };
        cp.round = 1;
        db.save_checkpoint(&cp).unwrap();

        let loaded = db.load_checkpoint(&thread.id).unwrap().unwrap();
        assert_eq!(loaded.phase, TurnPhase::Tools { next: 0 });
        assert_eq!(loaded.round, 1);
        assert_eq!(loaded.state.messages.len(), 1);
    }

    #[test]
    fn test_connection_secret_stored_as_blobs() {
        let db = test_db();
        let cipher = SecretCipher::from_master_key("master").unwrap();
        let stored = db.insert_connection(record(5, &cipher)).unwrap();
        assert!(stored.id > 0);

        let loaded = db.get_connection(5, stored.id).unwrap().unwrap();
        assert_eq!(loaded.secret, stored.secret);
        assert_eq!(
            cipher.decrypt(loaded.secret.as_ref().unwrap()).unwrap().as_str(),
            "hunter2"
        );

        let plaintext_hits: i64 = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM user_connections
                 WHERE instr(CAST(secret_ciphertext AS TEXT), 'hunter2') > 0",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(plaintext_hits, 0);
    }

    #[test]
    fn test_connection_owner_scoping_and_update() {
        let db = test_db();
        let cipher = SecretCipher::from_master_key("master").unwrap();
        let stored = db.insert_connection(record(5, &cipher)).unwrap();

        assert!(db.get_connection(6, stored.id).unwrap().is_none());
        assert_eq!(db.list_connections(5).unwrap().len(), 1);

        let mut rotated = stored.clone();
        rotated.secret = Some(cipher.encrypt("new-secret").unwrap());
        db.update_connection(&rotated).unwrap();
        let loaded = db.get_connection(5, stored.id).unwrap().unwrap();
        assert_ne!(loaded.fingerprint(), stored.fingerprint());

        let mut foreign = rotated.clone();
        foreign.owner_id = 6;
        assert!(matches!(
            db.update_connection(&foreign),
            Err(ConnectionError::NotFound { .. })
        ));
    }
}
