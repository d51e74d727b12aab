//! SQLite driver.
//!
//! Files are opened read-only through an `r2d2` pool. Queries run on the
//! blocking pool; a query that outlives its timeout is stopped by the
//! connection's progress handler.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tokio_util::sync::CancellationToken;

use super::errors::ConnectionError;
use super::schema::{ColumnInfo, SchemaScan, TableSchema};
use super::types::QueryResult;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

/// Open a read-only pool over the database file at `path`.
pub fn open_pool(
    path: &str,
    max_size: u32,
    connect_timeout: Duration,
) -> Result<SqlitePool, ConnectionError> {
    if !Path::new(path).is_file() {
        return Err(ConnectionError::ConnectionFailed {
            target: path.to_string(),
            reason: "database file does not exist".into(),
        });
    }

    let manager = SqliteConnectionManager::file(path).with_flags(
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    );

    r2d2::Pool::builder()
        .max_size(max_size.max(1))
        .min_idle(Some(0))
        .connection_timeout(connect_timeout)
        .build(manager)
        .map_err(|e| ConnectionError::ConnectionFailed {
            target: path.to_string(),
            reason: e.to_string(),
        })
}

fn cell_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

fn cell_display(value: ValueRef<'_>) -> String {
    match cell_value(value) {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Run `sql` on an open connection, keeping at most `row_cap` rows.
pub fn execute_on(conn: &Connection, sql: &str, row_cap: usize) -> Result<QueryResult, ConnectionError> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(ConnectionError::UnsafeSqlRejected {
            reason: "statement would modify the database".into(),
        });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next()? {
        if out.len() >= row_cap {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(cell_value(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok(QueryResult {
        columns,
        rows: out,
        truncated,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Introspect every user table on an open connection.
pub fn introspect_on(
    conn: &Connection,
    sample_rows: usize,
    max_tables: usize,
) -> Result<SchemaScan, ConnectionError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    let (names, unscanned) = SchemaScan::cutoff(names, max_tables);

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
        let columns: Vec<ColumnInfo> = info
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<_, _>>()?;

        let mut sample = conn.prepare(&format!(
            "SELECT * FROM {} LIMIT {}",
            quote_ident(&name),
            sample_rows
        ))?;
        let width = sample.column_count();
        let mut rows = sample.query([])?;
        let mut sample_rows_out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for i in 0..width {
                cells.push(cell_display(row.get_ref(i)?));
            }
            sample_rows_out.push(cells);
        }

        tables.push(TableSchema {
            name,
            columns,
            sample_rows: sample_rows_out,
        });
    }
    Ok(SchemaScan { tables, unscanned })
}

/// VM instructions between abort-flag checks while a statement runs.
const PROGRESS_OPS: i32 = 1_000;

/// Run blocking work on a pooled connection with a timeout and cancellation.
///
/// On timeout or cancellation an abort flag is raised; the connection's
/// progress handler sees it and stops the running statement, so the blocking
/// thread returns promptly and the connection goes back to the pool.
pub async fn with_connection<T, F>(
    pool: &SqlitePool,
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, ConnectionError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, ConnectionError> + Send + 'static,
{
    let pool = pool.clone();
    let aborted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&aborted);

    let task = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| ConnectionError::ConnectionFailed {
            target: "sqlite".into(),
            reason: e.to_string(),
        })?;
        if flag.load(Ordering::SeqCst) {
            return Err(ConnectionError::Cancelled);
        }
        let watch = Arc::clone(&flag);
        conn.progress_handler(PROGRESS_OPS, Some(move || watch.load(Ordering::SeqCst)));
        let result = work(&conn);
        conn.progress_handler(0, None::<fn() -> bool>);
        result
    });

    tokio::select! {
        joined = task => match joined {
            Ok(result) => result,
            Err(e) => Err(ConnectionError::QueryFailed {
                message: format!("query task failed: {e}"),
            }),
        },
        _ = tokio::time::sleep(timeout) => {
            aborted.store(true, Ordering::SeqCst);
            Err(ConnectionError::QueryTimeout {
                timeout_secs: timeout.as_secs(),
            })
        }
        _ = cancel.cancelled() => {
            aborted.store(true, Ordering::SeqCst);
            Err(ConnectionError::Cancelled)
        }
    }
}
