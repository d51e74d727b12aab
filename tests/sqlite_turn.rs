//! End-to-end turns over a SQLite sample database with a scripted model.

use std::sync::Arc;

use aigis::agent_core::{
    AgentError, AgentSettings, AnalystSettings, CheckpointStore, Message, SqliteStore,
    ThreadStore, TurnPhase,
};
use aigis::connections::{
    ConnectionManager, ConnectionStore, DatabaseSettings, DbType, NewConnection, SecretCipher,
};
use aigis::inference::{Generator, ModelRegistry, ScriptStep, ScriptedGenerator, ToolCall};
use aigis::{Engine, StreamEvent};
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

const COUNT_SQL: &str = "SELECT COUNT(*) AS completed FROM sales WHERE status = 'completed'";

fn sample_db(dir: &TempDir) -> String {
    let path = dir.path().join("crm.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE leads (id INTEGER PRIMARY KEY, name TEXT NOT NULL, source TEXT);
         CREATE TABLE sales (
             id INTEGER PRIMARY KEY,
             lead_id INTEGER REFERENCES leads(id),
             amount REAL NOT NULL,
             status TEXT NOT NULL
         );
         INSERT INTO leads (name, source) VALUES ('Ada', 'web'), ('Grace', 'ads'), ('Linus', 'web');
         INSERT INTO sales (lead_id, amount, status) VALUES
             (1, 120.0, 'completed'), (2, 80.5, 'completed'), (3, 42.0, 'pending');",
    )
    .unwrap();
    path.to_string_lossy().into_owned()
}

fn engine_on(store: &Arc<SqliteStore>, generator: &Arc<ScriptedGenerator>, agent: AgentSettings) -> Engine {
    let registry = ModelRegistry::builder()
        .model(
            "qwen3-8b",
            &["qwen"],
            Arc::clone(generator) as Arc<dyn Generator>,
        )
        .default_model("qwen3-8b")
        .build()
        .unwrap();
    let connections = ConnectionManager::new(
        Arc::clone(store) as Arc<dyn ConnectionStore>,
        SecretCipher::from_master_key("integration-master-key").unwrap(),
        DatabaseSettings::default(),
    );
    Engine::new(
        Arc::new(registry),
        Arc::new(connections),
        Arc::clone(store) as Arc<dyn ThreadStore>,
        Arc::clone(store) as Arc<dyn CheckpointStore>,
        agent,
        AnalystSettings::default(),
    )
}

fn fast() -> AgentSettings {
    AgentSettings {
        model_retry_backoff_ms: 1,
        model_timeout_secs: 10,
        ..AgentSettings::default()
    }
}

struct World {
    dir: TempDir,
    store: Arc<SqliteStore>,
    generator: Arc<ScriptedGenerator>,
    engine: Engine,
    connection_id: i64,
}

fn world(steps: Vec<ScriptStep>, agent: AgentSettings) -> World {
    let dir = tempfile::tempdir().unwrap();
    let db_path = sample_db(&dir);
    let store = Arc::new(SqliteStore::open(&dir.path().join("aigis.db").to_string_lossy()).unwrap());
    let generator = Arc::new(ScriptedGenerator::new(steps));
    let engine = engine_on(&store, &generator, agent);
    let record = engine
        .connections()
        .add_connection(&NewConnection {
            owner_id: 1,
            name: "crm".into(),
            db_type: Some(DbType::Sqlite),
            host: Some(db_path),
            ..Default::default()
        })
        .unwrap();
    World {
        dir,
        store,
        generator,
        engine,
        connection_id: record.id,
    }
}

fn assert_single_terminal_last(events: &[StreamEvent]) {
    let terminals: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals, vec![events.len() - 1], "events: {events:?}");
}

#[tokio::test]
async fn test_completed_sales_question_end_to_end() {
    let w = world(
        vec![
            ScriptStep::call("ask_database", json!({"query": "number of completed sales"})),
            ScriptStep::reply(format!("```sql\n{COUNT_SQL}\n```")),
            ScriptStep::reply("There are 2 completed sales."),
        ],
        fast(),
    );
    let thread_id = w.engine.create_thread(1).unwrap();
    w.engine
        .set_connection(&thread_id, vec![w.connection_id])
        .await
        .unwrap();

    let events: Vec<StreamEvent> = w
        .engine
        .send_message(&thread_id, "how many sales are completed?")
        .await
        .collect()
        .await;
    assert_single_terminal_last(&events);

    let tool_result = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolResult { content } => Some(content.clone()),
            _ => None,
        })
        .expect("tool_result event");
    assert_eq!(tool_result["type"], "query_result");
    assert_eq!(tool_result["sql"], COUNT_SQL);
    assert_eq!(tool_result["rows"], json!([[2]]));

    let chunks: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    match events.last() {
        Some(StreamEvent::End { full_response }) => {
            assert!(full_response.contains('2'));
            assert_eq!(full_response, &chunks);
        }
        other => panic!("expected end, got {other:?}"),
    }

    // Schema snapshot reached the SQL prompt; the last result reached the
    // final assistant prompt.
    let requests = w.generator.requests();
    let sql_prompt = requests[1][0].content.clone().unwrap_or_default();
    assert!(sql_prompt.contains("### leads") && sql_prompt.contains("### sales"));
    let final_system = requests[2][0].content.clone().unwrap_or_default();
    assert!(final_system.contains("<last_query_result>"));

    let roles: Vec<String> = w
        .engine
        .thread_messages(&thread_id)
        .unwrap()
        .iter()
        .map(|m| format!("{:?}", m.role).to_lowercase())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
}

#[tokio::test]
async fn test_question_about_second_connection_runs_there() {
    let w = world(
        vec![
            ScriptStep::call("ask_database", json!({"query": "count orders"})),
            ScriptStep::reply("SELECT COUNT(*) AS orders FROM orders"),
            ScriptStep::reply("The shop has 2 orders."),
        ],
        fast(),
    );
    let shop_path = w.dir.path().join("shop.db");
    rusqlite::Connection::open(&shop_path)
        .unwrap()
        .execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL);
             INSERT INTO orders (total) VALUES (19.0), (5.5);",
        )
        .unwrap();
    let shop = w
        .engine
        .connections()
        .add_connection(&NewConnection {
            owner_id: 1,
            name: "shop".into(),
            db_type: Some(DbType::Sqlite),
            host: Some(shop_path.to_string_lossy().into_owned()),
            ..Default::default()
        })
        .unwrap();

    let thread_id = w.engine.create_thread(1).unwrap();
    w.engine
        .set_connection(&thread_id, vec![w.connection_id, shop.id])
        .await
        .unwrap();

    let events: Vec<StreamEvent> = w
        .engine
        .send_message(&thread_id, "how many orders does the shop have?")
        .await
        .collect()
        .await;
    assert_single_terminal_last(&events);
    let tool_result = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolResult { content } => Some(content.clone()),
            _ => None,
        })
        .expect("tool_result event");
    assert_eq!(tool_result["connection"], "shop");
    assert_eq!(tool_result["rows"], json!([[2]]));

    let system = w.generator.requests()[0][0].content.clone().unwrap_or_default();
    assert!(system.contains(&format!("connection_id={}", w.connection_id)));
    assert!(system.contains(&format!("connection_id={}", shop.id)));
}

#[tokio::test]
async fn test_mutating_sql_is_reported_not_run() {
    let w = world(
        vec![
            ScriptStep::call("ask_database", json!({"query": "remove pending sales"})),
            ScriptStep::reply("DELETE FROM sales WHERE status = 'pending'"),
            ScriptStep::reply("I can only read data, so I cannot delete sales."),
        ],
        fast(),
    );
    let thread_id = w.engine.create_thread(1).unwrap();
    w.engine
        .set_connection(&thread_id, vec![w.connection_id])
        .await
        .unwrap();

    let events: Vec<StreamEvent> = w
        .engine
        .send_message(&thread_id, "delete the pending sales")
        .await
        .collect()
        .await;
    assert_single_terminal_last(&events);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolResult { content } if content["error_kind"] == "UnsafeSqlRejected"
    )));
    assert!(matches!(events.last(), Some(StreamEvent::End { .. })));

    let conn = rusqlite::Connection::open(w.dir.path().join("crm.db")).unwrap();
    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM sales", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 3);
}

#[tokio::test]
async fn test_concurrent_send_exactly_one_busy() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let w = world(
        vec![ScriptStep::Gated(
            Arc::clone(&gate),
            Box::new(ScriptStep::reply("Hello!")),
        )],
        fast(),
    );
    let thread_id = w.engine.create_thread(1).unwrap();

    let (a, b) = tokio::join!(
        w.engine.try_send_message(&thread_id, "hi"),
        w.engine.try_send_message(&thread_id, "hi again"),
    );
    let (accepted, rejected) = match (a, b) {
        (Ok(stream), Err(e)) | (Err(e), Ok(stream)) => (stream, e),
        (a, b) => panic!("expected one accepted turn, got {:?} / {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(rejected, AgentError::ThreadBusy { .. }));

    gate.notify_one();
    let events: Vec<StreamEvent> = accepted.collect().await;
    assert!(matches!(events.last(), Some(StreamEvent::End { .. })));

    // The lease is free again once the terminal event arrived.
    let next: Vec<StreamEvent> = w.engine.send_message(&thread_id, "again").await.collect().await;
    assert_eq!(next.len(), 1);
    assert!(matches!(next[0], StreamEvent::Error { ref error } if error.starts_with("ModelUnavailable")));
}

#[tokio::test]
async fn test_resume_after_crash_enters_tools_without_model() {
    let w = world(Vec::new(), fast());
    let thread_id = w.engine.create_thread(1).unwrap();

    // Crash right after the ASSISTANT step requested a chart.
    let call = ToolCall {
        id: "call_chart".into(),
        name: "ask_analyst".into(),
        arguments: json!({"query": "bar chart of sales by status"}),
    };
    let mut checkpoint = w.store.load_checkpoint(&thread_id).unwrap().unwrap();
    checkpoint.state.messages.push(Message::user("chart my sales"));
    checkpoint
        .state
        .messages
        .push(Message::assistant("", vec![call]));
    checkpoint.phase = TurnPhase::Tools { next: 0 };
    checkpoint.round = 1;
    w.store.save_checkpoint(&checkpoint).unwrap();

    // A new process over the same store.
    let store = Arc::new(SqliteStore::open(&w.dir.path().join("aigis.db").to_string_lossy()).unwrap());
    let generator = Arc::new(ScriptedGenerator::new(vec![ScriptStep::reply(
        "I need to query the sales first.",
    )]));
    let engine = engine_on(&store, &generator, fast());

    let stream = engine.resume_turn(&thread_id).unwrap().expect("pending turn");
    let events: Vec<StreamEvent> = stream.collect().await;

    assert!(matches!(
        events.first(),
        Some(StreamEvent::ToolResult { content }) if content["error_kind"] == "NoQueryResult"
    ));
    assert_eq!(generator.call_count(), 1);
    assert!(matches!(events.last(), Some(StreamEvent::End { .. })));

    let saved = store.load_checkpoint(&thread_id).unwrap().unwrap();
    assert_eq!(saved.phase, TurnPhase::Done);
    assert!(engine.resume_turn(&thread_id).unwrap().is_none());
}

#[tokio::test]
async fn test_turn_budget_ends_with_single_error() {
    let agent = AgentSettings {
        max_round_trips: 1,
        ..fast()
    };
    let w = world(
        vec![
            ScriptStep::call("ask_analyst", json!({"query": "chart"})),
            ScriptStep::call("ask_analyst", json!({"query": "chart again"})),
        ],
        agent,
    );
    let thread_id = w.engine.create_thread(1).unwrap();
    let events: Vec<StreamEvent> = w.engine.send_message(&thread_id, "chart").await.collect().await;

    assert_single_terminal_last(&events);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { error }) if error.starts_with("TurnBudgetExceeded")
    ));
    let saved = w.store.load_checkpoint(&thread_id).unwrap().unwrap();
    assert!(matches!(saved.phase, TurnPhase::Failed { .. }));
}
