//! Connection Manager: encrypted connection records, pooled read-only
//! database handles, schema snapshots and guarded query execution.

pub mod crypto;
pub mod errors;
pub mod guard;
pub mod manager;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod types;

pub use crypto::{EncryptedSecret, SecretCipher};
pub use errors::ConnectionError;
pub use guard::{ensure_read_only, extract_sql, referenced_tables};
pub use manager::{ConnectionManager, DatabaseSettings, Handle};
pub use schema::SchemaLimits;
pub use store::{ConnectionStore, MemoryConnectionStore};
pub use types::{Credential, DbType, NewConnection, QueryResult, UserConnection};
