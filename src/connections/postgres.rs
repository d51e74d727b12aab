//! PostgreSQL driver.
//!
//! Pools come from `deadpool-postgres`. Every session is opened with
//! `default_transaction_read_only=on` and a server-side `statement_timeout`,
//! and a query that outlives the client-side timeout is cancelled through the
//! connection's cancel token.

use std::time::Duration;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;

use super::errors::ConnectionError;
use super::schema::{ColumnInfo, SchemaScan, TableSchema};
use super::types::{Credential, QueryResult};

pub const DEFAULT_PORT: u16 = 5432;

/// Session options applied to every pooled connection.
fn session_options(statement_timeout: Duration) -> String {
    format!(
        "-c default_transaction_read_only=on -c statement_timeout={}",
        statement_timeout.as_millis()
    )
}

/// Build a pool for `credential`. No connection is opened until first use.
pub fn create_pool(
    credential: &Credential,
    max_size: usize,
    connect_timeout: Duration,
    statement_timeout: Duration,
) -> Result<Pool, ConnectionError> {
    let host = credential
        .host
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| ConnectionError::InvalidRecord {
            reason: format!("connection '{}' has no host", credential.name),
        })?;

    let mut cfg = Config::new();
    cfg.host = Some(host.to_string());
    cfg.port = Some(credential.port.unwrap_or(DEFAULT_PORT));
    cfg.user = credential.username.clone();
    cfg.password = credential.password().map(str::to_string);
    cfg.dbname = credential.database_name.clone();
    cfg.connect_timeout = Some(connect_timeout);
    cfg.options = Some(session_options(statement_timeout));
    cfg.application_name = Some("aigis".into());

    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    let mut pool_cfg = PoolConfig::new(max_size.max(1));
    pool_cfg.timeouts = Timeouts {
        wait: Some(connect_timeout),
        create: Some(connect_timeout),
        recycle: Some(connect_timeout),
    };
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| ConnectionError::ConnectionFailed {
            target: credential.target(),
            reason: format!("failed to create pool: {e}"),
        })
}

async fn checkout(pool: &Pool) -> Result<deadpool_postgres::Object, ConnectionError> {
    pool.get().await.map_err(|e| ConnectionError::ConnectionFailed {
        target: "postgres".into(),
        reason: e.to_string(),
    })
}

/// Wrap `sql` so the server never returns more than `row_cap + 1` rows.
fn bounded_sql(sql: &str, row_cap: usize) -> String {
    format!(
        "SELECT * FROM ({sql}) AS bounded_result LIMIT {}",
        row_cap.saturating_add(1)
    )
}

/// Convert a text-format cell to JSON using the column's declared type.
fn parse_text_value(ty: &Type, raw: Option<&str>) -> serde_json::Value {
    let Some(raw) = raw else {
        return serde_json::Value::Null;
    };
    match *ty {
        Type::BOOL => match raw {
            "t" => serde_json::Value::Bool(true),
            "f" => serde_json::Value::Bool(false),
            other => serde_json::Value::String(other.to_string()),
        },
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => raw
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(raw.to_string())),
        Type::JSON | Type::JSONB => serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        _ => serde_json::Value::String(raw.to_string()),
    }
}

async fn run_query(
    client: &tokio_postgres::Client,
    sql: &str,
    row_cap: usize,
) -> Result<QueryResult, ConnectionError> {
    let bounded = bounded_sql(sql, row_cap);

    // Prepare for column names and types, then fetch text values so any
    // column type can be returned.
    let statement = client.prepare(&bounded).await?;
    let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();
    let types: Vec<Type> = statement.columns().iter().map(|c| c.type_().clone()).collect();

    let messages = client.simple_query(&bounded).await?;
    let mut rows = Vec::new();
    let mut truncated = false;
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            if rows.len() >= row_cap {
                truncated = true;
                break;
            }
            let values = types
                .iter()
                .enumerate()
                .map(|(i, ty)| parse_text_value(ty, row.get(i)))
                .collect();
            rows.push(values);
        }
    }

    Ok(QueryResult {
        columns,
        rows,
        truncated,
    })
}

/// Run a guarded query with a timeout and cancellation.
pub async fn execute(
    pool: &Pool,
    sql: &str,
    row_cap: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<QueryResult, ConnectionError> {
    let client = checkout(pool).await?;
    let cancel_token = client.cancel_token();

    tokio::select! {
        result = run_query(&client, sql, row_cap) => result,
        _ = tokio::time::sleep(timeout) => {
            if let Err(e) = cancel_token.cancel_query(NoTls).await {
                tracing::warn!(error = %e, "failed to cancel timed-out postgres query");
            }
            Err(ConnectionError::QueryTimeout {
                timeout_secs: timeout.as_secs(),
            })
        }
        _ = cancel.cancelled() => {
            if let Err(e) = cancel_token.cancel_query(NoTls).await {
                tracing::warn!(error = %e, "failed to cancel postgres query");
            }
            Err(ConnectionError::Cancelled)
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Introspect user tables outside the system schemas.
pub async fn introspect(
    pool: &Pool,
    sample_rows: usize,
    max_tables: usize,
) -> Result<SchemaScan, ConnectionError> {
    let client = checkout(pool).await?;
    let rows = client
        .query(
            "SELECT c.table_schema::text, c.table_name::text, c.column_name::text, c.data_type::text
             FROM information_schema.columns c
             JOIN information_schema.tables t
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name
             WHERE t.table_type = 'BASE TABLE'
               AND c.table_schema NOT IN ('pg_catalog', 'information_schema')
             ORDER BY c.table_schema, c.table_name, c.ordinal_position",
            &[],
        )
        .await?;

    let mut tables: Vec<(String, String, Vec<ColumnInfo>)> = Vec::new();
    for row in rows {
        let schema: String = row.try_get(0)?;
        let table: String = row.try_get(1)?;
        let column = ColumnInfo {
            name: row.try_get(2)?,
            data_type: row.try_get(3)?,
        };
        match tables.last_mut() {
            Some((s, t, cols)) if *s == schema && *t == table => cols.push(column),
            _ => tables.push((schema, table, vec![column])),
        }
    }

    let display = |schema: &str, table: &str| {
        if schema == "public" {
            table.to_string()
        } else {
            format!("{schema}.{table}")
        }
    };
    let unscanned: Vec<String> = tables
        .iter()
        .skip(max_tables)
        .map(|(schema, table, _)| display(schema, table))
        .collect();
    tables.truncate(max_tables);

    let mut out = Vec::with_capacity(tables.len());
    for (schema, table, columns) in tables {
        let sample_sql = format!(
            "SELECT * FROM {}.{} LIMIT {}",
            quote_ident(&schema),
            quote_ident(&table),
            sample_rows
        );
        let mut samples = Vec::new();
        for message in client.simple_query(&sample_sql).await? {
            if let SimpleQueryMessage::Row(row) = message {
                let cells = (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect();
                samples.push(cells);
            }
        }
        out.push(TableSchema {
            name: display(&schema, &table),
            columns,
            sample_rows: samples,
        });
    }
    Ok(SchemaScan {
        tables: out,
        unscanned,
    })
}

/// Open one connection and run `SELECT 1`.
pub async fn ping(pool: &Pool) -> Result<(), ConnectionError> {
    let client = checkout(pool).await?;
    client.simple_query("SELECT 1").await?;
    Ok(())
}
