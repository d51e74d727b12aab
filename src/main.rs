use std::io::Write;
use std::sync::Arc;

use aigis::agent_core::{CheckpointStore, SqliteStore, ThreadStore};
use aigis::connections::{
    ConnectionManager, ConnectionStore, DbType, NewConnection, SecretCipher,
};
use aigis::inference::ModelRegistry;
use aigis::{AppConfig, Engine, TurnStream, WireFormat};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "aigis")]
#[command(about = "Ask your database questions in plain language", long_about = None)]
struct Cli {
    /// Config file (overrides AIGIS_CONFIG and the default locations)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a database, streaming wire events to stdout
    Chat {
        #[arg(long)]
        owner: i64,
        /// Connection to query; repeat to select several
        #[arg(long = "connection")]
        connections: Vec<i64>,
        /// Model name or alias
        #[arg(long)]
        model: Option<String>,
        /// Continue an existing thread instead of creating one
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, default_value = "sse")]
        format: WireFormat,
    },
    /// Manage stored connections
    Connection {
        #[command(subcommand)]
        action: ConnectionCommands,
    },
    /// List configured models and their availability
    Models,
}

#[derive(Subcommand)]
enum ConnectionCommands {
    /// Encrypt and store a connection record
    Add {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        name: String,
        /// postgres or sqlite
        #[arg(long)]
        db_type: DbType,
        /// Host name, or the file path for SQLite
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        database: Option<String>,
        #[arg(long, env = "AIGIS_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Open the connection and run `SELECT 1`
    Test {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        id: i64,
    },
    /// List an owner's connections
    List {
        #[arg(long)]
        owner: i64,
    },
}

struct App {
    config: AppConfig,
    store: Arc<SqliteStore>,
    connections: Arc<ConnectionManager>,
}

impl App {
    fn open(config: AppConfig) -> Result<Self> {
        let path = config.storage_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            SqliteStore::open(&path.to_string_lossy())
                .with_context(|| format!("failed to open store {}", path.display()))?,
        );
        let cipher = SecretCipher::from_master_key(&config.master_key()?)?;
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&store) as Arc<dyn ConnectionStore>,
            cipher,
            config.database.clone(),
        ));
        Ok(Self {
            config,
            store,
            connections,
        })
    }

    fn engine(&self) -> Result<Engine> {
        let registry = ModelRegistry::from_config(&self.config.models)?;
        Ok(Engine::new(
            Arc::new(registry),
            Arc::clone(&self.connections),
            Arc::clone(&self.store) as Arc<dyn ThreadStore>,
            Arc::clone(&self.store) as Arc<dyn CheckpointStore>,
            self.config.agent.clone(),
            self.config.analyst.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?.0,
    };
    let log_path = aigis::logging::init_tracing(&aigis::logging::data_dir(), config.log_filter())
        .context("failed to initialise logging")?;

    match cli.command {
        Commands::Models => {
            let registry = ModelRegistry::from_config(&config.models)?;
            for model in registry.descriptors() {
                let default = registry.default_model() == Some(model.name.as_str());
                println!(
                    "{}{} [{}] {}{}",
                    model.name,
                    if default { " (default)" } else { "" },
                    model.provider,
                    if model.available { "available" } else { "unavailable" },
                    if model.aliases.is_empty() {
                        String::new()
                    } else {
                        format!(", aliases: {}", model.aliases.join(", "))
                    },
                );
                if let Some(ref reason) = model.unavailable_reason {
                    println!("    {reason}");
                }
            }
        }
        Commands::Connection { action } => {
            let app = App::open(config)?;
            match action {
                ConnectionCommands::Add {
                    owner,
                    name,
                    db_type,
                    host,
                    port,
                    username,
                    database,
                    password,
                } => {
                    let record = app.connections.add_connection(&NewConnection {
                        owner_id: owner,
                        name,
                        db_type: Some(db_type),
                        host: Some(host),
                        port,
                        username,
                        database_name: database,
                        password: password.map(zeroize::Zeroizing::new),
                    })?;
                    println!("connection {} '{}' ({}) stored", record.id, record.name, record.db_type);
                }
                ConnectionCommands::Test { owner, id } => {
                    app.connections.test_connection(owner, id).await?;
                    println!("connection {id} ok");
                }
                ConnectionCommands::List { owner } => {
                    for record in app.store.list_connections(owner)? {
                        println!(
                            "{}\t{}\t{}\t{}",
                            record.id,
                            record.name,
                            record.db_type,
                            record.host.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }
        Commands::Chat {
            owner,
            connections,
            model,
            thread,
            format,
        } => {
            let app = App::open(config)?;
            let engine = app.engine()?;
            let thread_id = match thread {
                Some(id) => id,
                None => engine.create_thread(owner)?,
            };
            if let Some(ref name) = model {
                engine.set_model(&thread_id, name)?;
            }
            if !connections.is_empty() {
                engine.set_connection(&thread_id, connections).await?;
            }
            eprintln!("thread {thread_id} (log: {})", log_path.display());

            if let Some(stream) = engine.resume_turn(&thread_id)? {
                eprintln!("resuming unfinished turn");
                print_stream(stream, format).await?;
            }
            chat_loop(&engine, &thread_id, format).await?;
        }
    }

    Ok(())
}

/// Read questions from stdin until EOF or `/quit`.
///
/// `/model <name>` switches the thread's model.
async fn chat_loop(engine: &Engine, thread_id: &str, format: WireFormat) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(name) = line.strip_prefix("/model ") {
            match engine.set_model(thread_id, name.trim()) {
                Ok(canonical) => eprintln!("model: {canonical}"),
                Err(e) => eprintln!("{}", e.client_message()),
            }
            continue;
        }
        print_stream(engine.send_message(thread_id, line).await, format).await?;
    }
    Ok(())
}

async fn print_stream(mut stream: TurnStream, format: WireFormat) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        stdout.write_all(format.frame(&event).as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}
