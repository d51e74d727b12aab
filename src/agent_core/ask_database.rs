//! `ask_database`: natural language → SQL → rows.
//!
//! The model writes one statement from the schema snapshot. The statement is
//! checked by the read-only guard before the Connection Manager ever sees it.
//! Database errors go back to the model verbatim; there is no automatic SQL
//! retry, the next assistant step corrects it within the turn budget.
//!
//! With several connections selected, the statement runs on the connection
//! named by the `connection_id` argument, or else on the connection whose
//! snapshot lists the tables the statement reads.

use serde_json::json;

use crate::connections::schema::connection_tables;
use crate::connections::{ensure_read_only, extract_sql, referenced_tables};

use super::prompts;
use super::tool_router::{tool_completion, ToolContext, ToolError, ToolOutcome};

pub async fn ask_database(
    ctx: &ToolContext<'_>,
    query: &str,
    connection_id: Option<i64>,
) -> Result<ToolOutcome, ToolError> {
    let schema = ctx
        .state
        .db_schema_snapshot
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ToolError::recoverable(
                "SchemaUnavailable",
                "No database schema is available for this conversation. \
                 Ask the user to connect a database first.",
            )
        })?;

    let requested = match connection_id {
        Some(id) if ctx.state.connection_ref.contains(&id) => Some(id),
        Some(id) => {
            return Err(ToolError::recoverable(
                "InvalidArguments",
                format!(
                    "connection {id} is not selected in this conversation; selected: {:?}",
                    ctx.state.connection_ref
                ),
            ))
        }
        None => None,
    };
    if ctx.state.connection_ref.is_empty() {
        return Err(ToolError::recoverable(
            "SchemaUnavailable",
            "No database is connected to this conversation.",
        ));
    }

    let generation = tool_completion(ctx, prompts::sql_generation(schema, query)).await?;
    let sql = extract_sql(&generation.text);
    let sql = match ensure_read_only(&sql) {
        Ok(safe) => safe,
        Err(e) => {
            tracing::warn!(sql = %sql, error = %e, "generated SQL rejected");
            return Err(ToolError::recoverable(
                "UnsafeSqlRejected",
                format!("{e}. Rejected statement: {sql}"),
            ));
        }
    };
    let connection_id = requested
        .unwrap_or_else(|| route_connection(schema, &sql, &ctx.state.connection_ref));
    tracing::info!(connection_id, sql = %sql, "running generated SQL");

    let handle = ctx.connections.handle(ctx.owner_id, connection_id)?;
    let result = match ctx.connections.execute(&handle, &sql, ctx.cancel).await {
        Ok(result) => result,
        Err(e) => {
            return Err(match ToolError::from(e) {
                ToolError::Recoverable { kind, message } => {
                    ToolError::recoverable(kind, format!("{message}\nSQL: {sql}"))
                }
                fatal => fatal,
            })
        }
    };

    let content = json!({
        "type": "query_result",
        "connection": handle.name,
        "sql": sql,
        "columns": result.columns,
        "rows": result.rows,
        "row_count": result.row_count(),
        "truncated": result.truncated,
    });
    Ok(ToolOutcome {
        content,
        query_result: Some(result),
    })
}

/// Pick the selected connection whose snapshot section lists the most tables
/// `sql` reads. Ties go to the earlier selection; no match falls back to the
/// first selected connection.
fn route_connection(schema: &str, sql: &str, selected: &[i64]) -> i64 {
    let fallback = selected.first().copied().unwrap_or_default();
    if selected.len() < 2 {
        return fallback;
    }
    let referenced = referenced_tables(sql);
    let sections = connection_tables(schema);

    let mut best = (fallback, 0usize);
    for &id in selected {
        let Some((_, tables)) = sections.iter().find(|(section, _)| *section == id) else {
            continue;
        };
        let hits = referenced
            .iter()
            .filter(|name| {
                let name = name.as_str();
                let bare = name.strip_prefix("public.").unwrap_or(name);
                tables.iter().any(|t| t == name || t == bare)
            })
            .count();
        if hits > best.1 {
            best = (id, hits);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::agent_core::types::AgentState;
    use crate::connections::{
        ConnectionManager, DatabaseSettings, DbType, MemoryConnectionStore, NewConnection,
        SecretCipher,
    };
    use crate::inference::{ScriptStep, ScriptedGenerator};

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: ConnectionManager,
        state: AgentState,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (id INTEGER PRIMARY KEY, amount REAL, status TEXT);
             INSERT INTO sales (amount, status) VALUES (10, 'completed'), (5, 'completed'),
                (7, 'pending');",
        )
        .unwrap();

        let manager = ConnectionManager::new(
            Arc::new(MemoryConnectionStore::new()),
            SecretCipher::from_master_key("master").unwrap(),
            DatabaseSettings::default(),
        );
        let record = manager
            .add_connection(&NewConnection {
                owner_id: 1,
                name: "crm".into(),
                db_type: Some(DbType::Sqlite),
                host: Some(path.to_string_lossy().into_owned()),
                ..Default::default()
            })
            .unwrap();
        let schema = manager
            .introspect_schema(1, &[record.id], &CancellationToken::new())
            .await
            .unwrap();

        let state = AgentState {
            db_schema_snapshot: Some(schema),
            connection_ref: vec![record.id],
            ..AgentState::default()
        };
        Fixture {
            _dir: dir,
            manager,
            state,
        }
    }

    fn ctx<'a>(
        f: &'a Fixture,
        generator: &'a ScriptedGenerator,
        cancel: &'a CancellationToken,
    ) -> ToolContext<'a> {
        ToolContext {
            owner_id: 1,
            model_name: "scripted",
            generator,
            connections: &f.manager,
            state: &f.state,
            cancel,
            model_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_generates_and_runs_sql() {
        let f = fixture().await;
        let generator = ScriptedGenerator::new(vec![ScriptStep::reply(
            "```sql\nSELECT COUNT(*) AS completed FROM sales WHERE status = 'completed'\n```",
        )]);
        let cancel = CancellationToken::new();

        let outcome = ask_database(&ctx(&f, &generator, &cancel), "how many completed sales?", None)
            .await
            .unwrap();
        assert_eq!(outcome.content["type"], "query_result");
        assert_eq!(outcome.content["rows"], json!([[2]]));
        assert_eq!(outcome.query_result.unwrap().columns, vec!["completed"]);

        let prompt = &generator.requests()[0];
        assert!(prompt[0].content.as_deref().unwrap().contains("### sales"));
    }

    #[tokio::test]
    async fn test_mutating_sql_never_reaches_database() {
        let f = fixture().await;
        let generator = ScriptedGenerator::new(vec![ScriptStep::reply("DELETE FROM sales")]);
        let cancel = CancellationToken::new();

        let err = ask_database(&ctx(&f, &generator, &cancel), "clean up", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Recoverable { kind: "UnsafeSqlRejected", .. }));
        assert_eq!(f.manager.pool_count(), 1);

        let count: i64 = {
            let handle = f.manager.handle(1, f.state.connection_ref[0]).unwrap();
            let result = f
                .manager
                .execute(&handle, "SELECT COUNT(*) FROM sales", &cancel)
                .await
                .unwrap();
            result.rows[0][0].as_i64().unwrap()
        };
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_sql_error_returned_verbatim() {
        let f = fixture().await;
        let generator = ScriptedGenerator::new(vec![ScriptStep::reply("SELECT * FROM salez")]);
        let cancel = CancellationToken::new();

        let err = ask_database(&ctx(&f, &generator, &cancel), "all sales", None)
            .await
            .unwrap_err();
        match err {
            ToolError::Recoverable { kind, message } => {
                assert_eq!(kind, "QueryFailed");
                assert!(message.contains("no such table: salez"));
                assert!(message.contains("SQL: SELECT * FROM salez"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_schema_fails_fast() {
        let mut f = fixture().await;
        f.state.db_schema_snapshot = None;
        let generator = ScriptedGenerator::new(vec![]);
        let cancel = CancellationToken::new();

        let err = ask_database(&ctx(&f, &generator, &cancel), "anything", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Recoverable { kind: "SchemaUnavailable", .. }));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_retried_once_then_fatal() {
        let f = fixture().await;
        let generator = ScriptedGenerator::new(vec![
            ScriptStep::Fail("down".into()),
            ScriptStep::Fail("still down".into()),
        ]);
        let cancel = CancellationToken::new();

        let err = ask_database(&ctx(&f, &generator, &cancel), "count", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Fatal(crate::agent_core::AgentError::ModelUnavailable { .. })));
        assert_eq!(generator.call_count(), 2);
    }

    async fn two_connection_fixture() -> (Fixture, i64) {
        let mut f = fixture().await;
        let path = f._dir.path().join("shop.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL);
                 INSERT INTO orders (total) VALUES (9.5), (12.0), (3.25);",
            )
            .unwrap();
        let shop = f
            .manager
            .add_connection(&NewConnection {
                owner_id: 1,
                name: "shop".into(),
                db_type: Some(DbType::Sqlite),
                host: Some(path.to_string_lossy().into_owned()),
                ..Default::default()
            })
            .unwrap();
        f.state.connection_ref.push(shop.id);
        f.state.db_schema_snapshot = Some(
            f.manager
                .introspect_schema(1, &f.state.connection_ref, &CancellationToken::new())
                .await
                .unwrap(),
        );
        (f, shop.id)
    }

    #[tokio::test]
    async fn test_routes_to_connection_owning_the_table() {
        let (f, shop_id) = two_connection_fixture().await;
        let generator =
            ScriptedGenerator::new(vec![ScriptStep::reply("SELECT COUNT(*) AS n FROM orders")]);
        let cancel = CancellationToken::new();

        let outcome = ask_database(&ctx(&f, &generator, &cancel), "count orders", None)
            .await
            .unwrap();
        assert_eq!(outcome.content["connection"], "shop");
        assert_eq!(outcome.content["rows"], json!([[3]]));

        let prompt = generator.requests()[0][0].content.clone().unwrap_or_default();
        assert!(prompt.contains(&format!("(sqlite, connection_id={shop_id})")));
    }

    #[tokio::test]
    async fn test_explicit_connection_id_wins() {
        let (f, _shop_id) = two_connection_fixture().await;
        let crm_id = f.state.connection_ref[0];
        let generator =
            ScriptedGenerator::new(vec![ScriptStep::reply("SELECT COUNT(*) FROM orders")]);
        let cancel = CancellationToken::new();

        let err = ask_database(&ctx(&f, &generator, &cancel), "count orders", Some(crm_id))
            .await
            .unwrap_err();
        match err {
            ToolError::Recoverable { kind, message } => {
                assert_eq!(kind, "QueryFailed");
                assert!(message.contains("no such table: orders"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_route_connection_prefers_most_matches() {
        let schema = "## Connection: crm (postgres, connection_id=1)\n\n### leads\n\n### sales\n\n\
                      ## Connection: shop (postgres, connection_id=2)\n\n### orders\n\n### sales\n\n";
        assert_eq!(route_connection(schema, "SELECT * FROM public.orders", &[1, 2]), 2);
        assert_eq!(
            route_connection(schema, "SELECT * FROM leads JOIN sales ON true", &[1, 2]),
            1
        );
        assert_eq!(route_connection(schema, "SELECT * FROM sales", &[2, 1]), 2);
        assert_eq!(route_connection(schema, "SELECT * FROM unknown", &[2, 1]), 2);
        assert_eq!(route_connection(schema, "SELECT * FROM orders", &[1]), 1);
    }
}
