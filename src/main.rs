use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use parlor_bot::{CommandRegistry, StooqClient, WorkerPool, WorkerPoolConfig};
use parlor_core::amqp::DEFAULT_AMQP_URL;
use parlor_core::{AmqpBroker, AuthenticatedUser, Broker, MemoryBroker, QueueSide};
use parlor_server::{JwtAuthenticator, ServerConfig, Services};
use parlor_store::{Database, RoomRepo, UserRepo};
use parlor_telemetry::{
    init_telemetry, parse_module_level, LogFormat, MetricsRecorder, TelemetryConfig,
    TelemetryGuard,
};

/// Capacity of each in-process command queue.
const BROKER_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "parlor", version, about = "Chat rooms with a stock quote assistant")]
struct Cli {
    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// Log output format (json or pretty).
    #[arg(long, env = "PARLOR_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    /// Per-module level override such as `parlor_server=debug`. Repeatable.
    #[arg(
        long = "log-module",
        env = "PARLOR_LOG_MODULES",
        value_delimiter = ',',
        value_parser = parse_module_level,
        global = true
    )]
    log_modules: Vec<(String, Level)>,

    /// SQLite database path. Defaults to ~/.parlor/parlor.db.
    #[arg(long, env = "PARLOR_DB", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat hub. With the in-process broker the assistant workers
    /// run alongside it.
    Serve(ServeArgs),
    /// Run only the assistant workers against an AMQP broker.
    Worker(WorkerCommandArgs),
    /// Manage chat rooms.
    Rooms {
        #[command(subcommand)]
        action: RoomsCommand,
    },
    /// Issue an access token for a user.
    Token(TokenArgs),
}

#[derive(Subcommand)]
enum RoomsCommand {
    /// Print every room as JSON.
    List,
    /// Create a room and print its id.
    Create,
}

/// Where hub and workers exchange commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// In-process queues; workers run inside `serve`.
    Memory,
    /// RabbitMQ queues shared with separate `worker` processes.
    Amqp,
}

#[derive(Args)]
struct AmqpArgs {
    #[arg(long, env = "PARLOR_AMQP_URL", default_value = DEFAULT_AMQP_URL, hide_env_values = true)]
    amqp_url: String,
}

#[derive(Args)]
struct WorkerArgs {
    /// Number of assistant workers; values below 1 run one.
    #[arg(long, env = "PARLOR_WORKERS", default_value_t = 1, allow_negative_numbers = true)]
    workers: i32,

    #[arg(long, env = "PARLOR_QUOTE_URL", default_value = parlor_bot::quote::DEFAULT_BASE_URL)]
    quote_url: String,

    #[arg(long, env = "PARLOR_QUOTE_TIMEOUT_SECS", default_value_t = 20)]
    quote_timeout_secs: u64,
}

impl WorkerArgs {
    fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            quote_base_url: self.quote_url.clone(),
            http_timeout: Duration::from_secs(self.quote_timeout_secs),
        }
    }
}

#[derive(Args)]
struct WorkerCommandArgs {
    #[command(flatten)]
    amqp: AmqpArgs,

    #[command(flatten)]
    pool: WorkerArgs,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "PARLOR_BIND", default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, env = "PARLOR_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "PARLOR_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Seconds without a heartbeat reply before a session is dropped.
    #[arg(long, env = "PARLOR_LIVENESS_SECS", default_value_t = 10)]
    liveness_secs: u64,

    #[arg(long, env = "PARLOR_MAX_FRAME_BYTES", default_value_t = 1000)]
    max_frame_bytes: usize,

    #[arg(long, env = "PARLOR_OUTBOUND_QUEUE", default_value_t = 64)]
    outbound_queue: usize,

    #[arg(long, env = "PARLOR_DRAIN_SECS", default_value_t = 5)]
    drain_secs: u64,

    #[arg(long, env = "PARLOR_PUBLISH_TIMEOUT_SECS", default_value_t = 5)]
    publish_timeout_secs: u64,

    #[arg(long, env = "PARLOR_BROKER", value_enum, default_value_t = BrokerKind::Memory)]
    broker: BrokerKind,

    #[command(flatten)]
    amqp: AmqpArgs,

    #[command(flatten)]
    pool: WorkerArgs,
}

impl ServeArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind.clone(),
            port: self.port,
            liveness_timeout: Duration::from_secs(self.liveness_secs),
            max_frame_bytes: self.max_frame_bytes,
            outbound_queue: self.outbound_queue,
            drain_timeout: Duration::from_secs(self.drain_secs),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
        }
    }
}

#[derive(Args)]
struct TokenArgs {
    #[arg(long)]
    id: i64,

    #[arg(long)]
    username: String,

    #[arg(long, env = "PARLOR_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules,
        format: cli.log_format,
    });

    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Command::Serve(args) => {
            let db = Database::open(&db_path).context("failed to open database")?;
            serve(args, db, &telemetry).await
        }
        Command::Worker(args) => worker(args, &telemetry).await,
        Command::Rooms { action } => {
            let db = Database::open(&db_path).context("failed to open database")?;
            rooms(action, RoomRepo::new(db))
        }
        Command::Token(args) => {
            let auth = JwtAuthenticator::new(&SecretString::from(args.jwt_secret));
            let token = auth.issue(&AuthenticatedUser::new(args.id, args.username))?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs, db: Database, telemetry: &TelemetryGuard) -> anyhow::Result<()> {
    let metrics = telemetry.metrics();
    let server_config = args.server_config();
    let shutdown = CancellationToken::new();

    let mut workers = Vec::new();
    let mut amqp = None;
    let broker: Arc<dyn Broker> = match args.broker {
        BrokerKind::Memory => {
            let (hub_side, worker_side) = MemoryBroker::pair(BROKER_CAPACITY);
            let pool = worker_pool(Arc::new(worker_side), &args.pool, Arc::clone(&metrics));
            workers = pool.start(shutdown.clone());
            Arc::new(hub_side)
        }
        BrokerKind::Amqp => {
            let broker = Arc::new(
                AmqpBroker::connect(&args.amqp.amqp_url, QueueSide::Hub)
                    .await
                    .context("failed to connect to broker")?,
            );
            amqp = Some(Arc::clone(&broker));
            broker
        }
    };

    let services = Services {
        store: Arc::new(RoomRepo::new(db.clone())),
        users: Arc::new(UserRepo::new(db)),
        broker,
        auth: Arc::new(JwtAuthenticator::new(&SecretString::from(args.jwt_secret))),
        metrics,
    };
    let handle = parlor_server::start(server_config, services, shutdown.clone())
        .await
        .context("failed to start server")?;

    tracing::info!(
        port = handle.port,
        broker = ?args.broker,
        workers = workers.len(),
        "parlor ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    shutdown.cancel();
    handle.join().await;
    for worker in workers {
        let _ = worker.await;
    }
    if let Some(broker) = amqp {
        broker.close().await;
    }
    Ok(())
}

async fn worker(args: WorkerCommandArgs, telemetry: &TelemetryGuard) -> anyhow::Result<()> {
    let broker = Arc::new(
        AmqpBroker::connect(&args.amqp.amqp_url, QueueSide::Worker)
            .await
            .context("failed to connect to broker")?,
    );
    let shutdown = CancellationToken::new();
    let pool = worker_pool(
        Arc::clone(&broker) as Arc<dyn Broker>,
        &args.pool,
        telemetry.metrics(),
    );
    let workers = pool.start(shutdown.clone());
    tracing::info!(workers = pool.worker_count(), "parlor worker ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    broker.close().await;
    Ok(())
}

fn worker_pool(
    broker: Arc<dyn Broker>,
    args: &WorkerArgs,
    metrics: Arc<MetricsRecorder>,
) -> WorkerPool {
    let config = args.pool_config();
    let quotes = Arc::new(StooqClient::new(config.quote_base_url, config.http_timeout));
    WorkerPool::new(
        broker,
        Arc::new(CommandRegistry::new(quotes)),
        config.workers,
        metrics,
    )
}

fn rooms(action: RoomsCommand, repo: RoomRepo) -> anyhow::Result<()> {
    match action {
        RoomsCommand::List => {
            let rooms = repo.list()?;
            println!("{}", serde_json::to_string_pretty(&rooms)?);
        }
        RoomsCommand::Create => {
            let id = repo.create()?;
            println!("{id}");
        }
    }
    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parlor")
        .join("parlor.db")
}
