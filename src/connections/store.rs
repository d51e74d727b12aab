//! Connection record storage seam.
//!
//! Records are created and edited by an external CRUD layer; the manager only
//! reads them. The durable implementation lives in
//! [`crate::agent_core::database::SqliteStore`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;

use super::crypto::SecretCipher;
use super::errors::ConnectionError;
use super::types::{DbType, NewConnection, UserConnection};

/// Read/write access to stored connection records.
pub trait ConnectionStore: Send + Sync {
    /// Fetch a record, scoped to its owner.
    fn get_connection(
        &self,
        owner_id: i64,
        connection_id: i64,
    ) -> Result<Option<UserConnection>, ConnectionError>;

    /// All records owned by `owner_id`, ordered by id.
    fn list_connections(&self, owner_id: i64) -> Result<Vec<UserConnection>, ConnectionError>;

    /// Store a new record and return it with its assigned id.
    fn insert_connection(&self, record: UserConnection) -> Result<UserConnection, ConnectionError>;

    /// Replace an existing record (same id and owner).
    fn update_connection(&self, record: &UserConnection) -> Result<(), ConnectionError>;
}

/// Turn CRUD input into a storable record, encrypting the password.
pub fn seal_connection(
    cipher: &SecretCipher,
    input: &NewConnection,
) -> Result<UserConnection, ConnectionError> {
    if input.name.trim().is_empty() {
        return Err(ConnectionError::InvalidRecord {
            reason: "connection name is empty".into(),
        });
    }
    let db_type = input.db_type.ok_or_else(|| ConnectionError::InvalidRecord {
        reason: "database type is required".into(),
    })?;
    if db_type == DbType::Sqlite
        && input.host.as_deref().unwrap_or_default().trim().is_empty()
        && input.database_name.as_deref().unwrap_or_default().trim().is_empty()
    {
        return Err(ConnectionError::InvalidRecord {
            reason: "sqlite connections need a file path".into(),
        });
    }

    let secret = match input.password.as_deref() {
        Some(password) if !password.is_empty() => Some(cipher.encrypt(password)?),
        _ => None,
    };

    Ok(UserConnection {
        id: 0,
        owner_id: input.owner_id,
        name: input.name.trim().to_string(),
        db_type,
        host: input.host.clone(),
        port: input.port,
        username: input.username.clone(),
        database_name: input.database_name.clone(),
        secret,
        updated_at: Utc::now(),
    })
}

// ─── In-memory store ────────────────────────────────────────────────────────

/// Process-local store for tests and scripted demos.
#[derive(Default)]
pub struct MemoryConnectionStore {
    records: Mutex<BTreeMap<i64, UserConnection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<i64, UserConnection>>, ConnectionError> {
        self.records.lock().map_err(|_| ConnectionError::Storage {
            reason: "connection store lock poisoned".into(),
        })
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn get_connection(
        &self,
        owner_id: i64,
        connection_id: i64,
    ) -> Result<Option<UserConnection>, ConnectionError> {
        Ok(self
            .lock()?
            .get(&connection_id)
            .filter(|r| r.owner_id == owner_id)
            .cloned())
    }

    fn list_connections(&self, owner_id: i64) -> Result<Vec<UserConnection>, ConnectionError> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn insert_connection(&self, mut record: UserConnection) -> Result<UserConnection, ConnectionError> {
        let mut records = self.lock()?;
        record.id = records.keys().next_back().copied().unwrap_or(0) + 1;
        records.insert(record.id, record.clone());
        Ok(record)
    }

    fn update_connection(&self, record: &UserConnection) -> Result<(), ConnectionError> {
        let mut records = self.lock()?;
        match records.get_mut(&record.id) {
            Some(existing) if existing.owner_id == record.owner_id => {
                *existing = record.clone();
                Ok(())
            }
            _ => Err(ConnectionError::NotFound {
                owner_id: record.owner_id,
                connection_id: record.id,
            }),
        }
    }
}
