//! Connection Manager.
//!
//! Turns a `(owner, connection_id)` reference into a live, pooled database
//! handle. Pools are keyed per owner and connection in a concurrent map so
//! unrelated users never contend on one lock. Each pool entry remembers the
//! fingerprint of the record it was built from; a changed record (a rotated
//! secret, a new host) replaces the entry on the next resolve.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::crypto::{EncryptedSecret, SecretCipher};
use super::errors::ConnectionError;
use super::guard::ensure_read_only;
use super::schema::{connection_header, render_markdown, SchemaLimits, SchemaScan};
use super::store::{seal_connection, ConnectionStore};
use super::types::{Credential, DbType, NewConnection, QueryResult, UserConnection};
use super::{postgres, sqlite};

// ─── Settings ───────────────────────────────────────────────────────────────

/// Bounds and timeouts for user databases (`database:` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Maximum rows returned by one query.
    pub row_cap: usize,
    pub query_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Sample rows per table in the schema snapshot.
    pub sample_rows: usize,
    pub max_tables: usize,
    pub max_schema_bytes: usize,
    pub pool_size: u32,
    /// Pools unused for this long are dropped by [`ConnectionManager::evict_idle`].
    pub pool_idle_ttl_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            row_cap: 1000,
            query_timeout_secs: 30,
            connect_timeout_secs: 5,
            sample_rows: 3,
            max_tables: 50,
            max_schema_bytes: 24_000,
            pool_size: 4,
            pool_idle_ttl_secs: 600,
        }
    }
}

impl DatabaseSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            sample_rows: self.sample_rows,
            max_tables: self.max_tables,
            max_bytes: self.max_schema_bytes,
        }
    }
}

// ─── Handles ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum DbPool {
    Sqlite(sqlite::SqlitePool),
    Postgres(deadpool_postgres::Pool),
}

struct PoolEntry {
    pool: DbPool,
    fingerprint: [u8; 32],
    last_used: Instant,
}

/// A live handle on one user connection. Cheap to clone; the underlying
/// pool stays owned by the manager.
#[derive(Clone)]
pub struct Handle {
    pub owner_id: i64,
    pub connection_id: i64,
    pub name: String,
    pub db_type: DbType,
    pool: DbPool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("owner_id", &self.owner_id)
            .field("connection_id", &self.connection_id)
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .finish()
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

pub struct ConnectionManager {
    store: Arc<dyn ConnectionStore>,
    cipher: SecretCipher,
    pools: DashMap<(i64, i64), PoolEntry>,
    settings: DatabaseSettings,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        cipher: SecretCipher,
        settings: DatabaseSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            pools: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Encrypt a plaintext secret for storage.
    pub fn encrypt_secret(&self, plaintext: &str) -> Result<EncryptedSecret, ConnectionError> {
        self.cipher.encrypt(plaintext)
    }

    /// Encrypt and store a new connection record.
    pub fn add_connection(&self, input: &NewConnection) -> Result<UserConnection, ConnectionError> {
        let record = seal_connection(&self.cipher, input)?;
        let stored = self.store.insert_connection(record)?;
        tracing::info!(
            owner_id = stored.owner_id,
            connection_id = stored.id,
            db_type = %stored.db_type,
            "connection record stored"
        );
        Ok(stored)
    }

    /// Look up a record and decrypt its secret in memory.
    pub fn resolve(&self, owner_id: i64, connection_id: i64) -> Result<Credential, ConnectionError> {
        let record = self
            .store
            .get_connection(owner_id, connection_id)?
            .ok_or(ConnectionError::NotFound {
                owner_id,
                connection_id,
            })?;

        let password: Option<Zeroizing<String>> = match record.secret {
            Some(ref secret) => Some(self.cipher.decrypt(secret)?),
            None => None,
        };

        Ok(Credential {
            connection_id: record.id,
            owner_id: record.owner_id,
            fingerprint: record.fingerprint(),
            name: record.name,
            db_type: record.db_type,
            host: record.host,
            port: record.port,
            username: record.username,
            database_name: record.database_name,
            password,
        })
    }

    fn create_pool(&self, credential: &Credential) -> Result<DbPool, ConnectionError> {
        match credential.db_type {
            DbType::Sqlite => {
                let path = credential
                    .sqlite_path()
                    .ok_or_else(|| ConnectionError::InvalidRecord {
                        reason: format!("connection '{}' has no file path", credential.name),
                    })?;
                Ok(DbPool::Sqlite(sqlite::open_pool(
                    path,
                    self.settings.pool_size,
                    self.settings.connect_timeout(),
                )?))
            }
            DbType::Postgres => Ok(DbPool::Postgres(postgres::create_pool(
                credential,
                self.settings.pool_size as usize,
                self.settings.connect_timeout(),
                // Server-side limit trails the client timeout so the client
                // side reports the timeout.
                self.settings.query_timeout() + Duration::from_secs(1),
            )?)),
        }
    }

    /// Return a pooled handle for `credential`, building or replacing the
    /// pool when needed.
    pub fn build_handle(&self, credential: &Credential) -> Result<Handle, ConnectionError> {
        self.evict_idle();

        let key = (credential.owner_id, credential.connection_id);
        let pool = match self.pools.get_mut(&key) {
            Some(mut entry) if entry.fingerprint == credential.fingerprint => {
                entry.last_used = Instant::now();
                Some(entry.pool.clone())
            }
            _ => None,
        };

        let pool = match pool {
            Some(pool) => pool,
            None => {
                let pool = self.create_pool(credential)?;
                let replaced = self
                    .pools
                    .insert(
                        key,
                        PoolEntry {
                            pool: pool.clone(),
                            fingerprint: credential.fingerprint,
                            last_used: Instant::now(),
                        },
                    )
                    .is_some();
                tracing::info!(
                    owner_id = credential.owner_id,
                    connection_id = credential.connection_id,
                    target = %credential.target(),
                    replaced,
                    "connection pool built"
                );
                pool
            }
        };

        Ok(Handle {
            owner_id: credential.owner_id,
            connection_id: credential.connection_id,
            name: credential.name.clone(),
            db_type: credential.db_type,
            pool,
        })
    }

    /// Resolve and open in one step. The decrypted credential is dropped
    /// before this returns.
    pub fn handle(&self, owner_id: i64, connection_id: i64) -> Result<Handle, ConnectionError> {
        let credential = self.resolve(owner_id, connection_id)?;
        self.build_handle(&credential)
    }

    /// Enumerate tables, columns and sample rows behind a handle.
    pub async fn introspect(
        &self,
        handle: &Handle,
        cancel: &CancellationToken,
    ) -> Result<SchemaScan, ConnectionError> {
        let sample_rows = self.settings.sample_rows;
        let max_tables = self.settings.max_tables;
        let timeout = self.settings.query_timeout();
        match handle.pool {
            DbPool::Sqlite(ref pool) => {
                sqlite::with_connection(pool, timeout, cancel, move |conn| {
                    sqlite::introspect_on(conn, sample_rows, max_tables)
                })
                .await
            }
            DbPool::Postgres(ref pool) => {
                tokio::select! {
                    result = tokio::time::timeout(timeout, postgres::introspect(pool, sample_rows, max_tables)) => {
                        result.map_err(|_| ConnectionError::QueryTimeout {
                            timeout_secs: timeout.as_secs(),
                        })?
                    }
                    _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
                }
            }
        }
    }

    /// Render the schema snapshot for the selected connections.
    ///
    /// Each connection gets its own `## Connection: <name> (<type>,
    /// connection_id=<id>)` section. The byte budget is shared between the
    /// sections, so the whole snapshot stays within `max_schema_bytes`.
    pub async fn introspect_schema(
        &self,
        owner_id: i64,
        connection_ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<String, ConnectionError> {
        let mut limits = self.settings.schema_limits();
        limits.max_bytes /= connection_ids.len().max(1);
        let mut out = String::new();
        for &connection_id in connection_ids {
            let handle = self.handle(owner_id, connection_id)?;
            let scan = self.introspect(&handle, cancel).await?;
            tracing::debug!(
                owner_id,
                connection_id,
                tables = scan.tables.len(),
                unscanned = scan.unscanned.len(),
                "schema introspected"
            );
            out.push_str(&connection_header(&handle.name, handle.db_type, connection_id));
            if scan.is_empty() {
                out.push_str("_No tables found._\n\n");
            } else {
                out.push_str(&render_markdown(&scan, &limits));
            }
        }
        Ok(out)
    }

    /// Run a read-only query with the configured row cap and timeout.
    pub async fn execute(
        &self,
        handle: &Handle,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, ConnectionError> {
        let sql = ensure_read_only(sql)?;
        let row_cap = self.settings.row_cap;
        let timeout = self.settings.query_timeout();
        let started = Instant::now();

        let result = match handle.pool {
            DbPool::Sqlite(ref pool) => {
                sqlite::with_connection(pool, timeout, cancel, move |conn| {
                    sqlite::execute_on(conn, &sql, row_cap)
                })
                .await
            }
            DbPool::Postgres(ref pool) => {
                postgres::execute(pool, &sql, row_cap, timeout, cancel).await
            }
        };

        match result {
            Ok(ref r) => tracing::info!(
                owner_id = handle.owner_id,
                connection_id = handle.connection_id,
                rows = r.row_count(),
                truncated = r.truncated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query executed"
            ),
            Err(ref e) => tracing::warn!(
                owner_id = handle.owner_id,
                connection_id = handle.connection_id,
                error = %e,
                "query failed"
            ),
        }
        result
    }

    /// Open a fresh, uncached handle and run `SELECT 1`.
    pub async fn test_connection(&self, owner_id: i64, connection_id: i64) -> Result<(), ConnectionError> {
        let credential = self.resolve(owner_id, connection_id)?;
        let pool = self.create_pool(&credential)?;
        let timeout = self.settings.connect_timeout();
        match pool {
            DbPool::Sqlite(pool) => {
                sqlite::with_connection(&pool, timeout, &CancellationToken::new(), |conn| {
                    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                    Ok(())
                })
                .await
            }
            DbPool::Postgres(pool) => tokio::time::timeout(timeout, postgres::ping(&pool))
                .await
                .map_err(|_| ConnectionError::ConnectionFailed {
                    target: credential.target(),
                    reason: format!("no response within {}s", timeout.as_secs()),
                })?,
        }
    }

    /// Drop the pool for a connection, e.g. after its secret was rotated.
    pub fn invalidate(&self, owner_id: i64, connection_id: i64) -> bool {
        let removed = self.pools.remove(&(owner_id, connection_id)).is_some();
        if removed {
            tracing::info!(owner_id, connection_id, "connection pool invalidated");
        }
        removed
    }

    /// Drop pools idle for longer than the configured TTL.
    pub fn evict_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.settings.pool_idle_ttl_secs);
        let before = self.pools.len();
        self.pools.retain(|_, entry| entry.last_used.elapsed() < ttl);
        let evicted = before.saturating_sub(self.pools.len());
        if evicted > 0 {
            tracing::debug!(evicted, "idle connection pools evicted");
        }
        evicted
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}
