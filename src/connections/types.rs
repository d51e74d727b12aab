//! Connection records, decrypted credentials and query results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::crypto::EncryptedSecret;
use super::errors::ConnectionError;

/// Database engines the manager can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Sqlite,
    Postgres,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Sqlite => "sqlite",
            DbType::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DbType::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(DbType::Postgres),
            other => Err(ConnectionError::UnsupportedDbType {
                db_type: other.to_string(),
            }),
        }
    }
}

/// A stored connection record. The secret is only ever held encrypted.
///
/// For SQLite, `host` (or `database_name` when `host` is empty) is the
/// database file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConnection {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub db_type: DbType,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database_name: Option<String>,
    pub secret: Option<EncryptedSecret>,
    pub updated_at: DateTime<Utc>,
}

impl UserConnection {
    /// Digest of every field a pooled handle depends on.
    ///
    /// A pool built from a record stays valid only while the fingerprint of
    /// the stored record is unchanged; rotating the secret changes it.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.db_type.as_str().as_bytes());
        for field in [&self.host, &self.username, &self.database_name] {
            hasher.update([0u8]);
            hasher.update(field.as_deref().unwrap_or_default().as_bytes());
        }
        hasher.update(self.port.unwrap_or(0).to_be_bytes());
        if let Some(ref secret) = self.secret {
            hasher.update(&secret.iv);
            hasher.update(&secret.ciphertext);
        }
        hasher.finalize().into()
    }
}

/// Fields needed to create a new connection record.
#[derive(Clone, Default)]
pub struct NewConnection {
    pub owner_id: i64,
    pub name: String,
    pub db_type: Option<DbType>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database_name: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

/// A decrypted credential, alive only while a handle is being opened.
///
/// The password is wiped on drop and never printed.
pub struct Credential {
    pub connection_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub db_type: DbType,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database_name: Option<String>,
    pub(crate) password: Option<Zeroizing<String>>,
    pub(crate) fingerprint: [u8; 32],
}

impl Credential {
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    /// Human-readable target for logs and errors (no secrets).
    pub fn target(&self) -> String {
        match self.db_type {
            DbType::Sqlite => self.sqlite_path().unwrap_or("<no path>").to_string(),
            DbType::Postgres => format!(
                "{}:{}/{}",
                self.host.as_deref().unwrap_or("localhost"),
                self.port.unwrap_or(5432),
                self.database_name.as_deref().unwrap_or("")
            ),
        }
    }

    pub(crate) fn sqlite_path(&self) -> Option<&str> {
        self.host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .or(self.database_name.as_deref())
            .filter(|p| !p.trim().is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("connection_id", &self.connection_id)
            .field("owner_id", &self.owner_id)
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("target", &self.target())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of a guarded query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// `true` when rows beyond the row cap were dropped.
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as `{column: value}` objects, for chart data.
    pub fn records(&self, limit: usize) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect()
    }
}
