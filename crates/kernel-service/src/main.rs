use clap::{Parser, ValueEnum};
use kernel_core::{KernelConfig, StorageConfig};
use kernel_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "kerneld", version, about = "Knowledge exchange kernel service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8091
    #[arg(long, default_value = "127.0.0.1:8091")]
    listen: SocketAddr,
    /// File used to persist overflowed audit events that failed to reach the store.
    #[arg(long, default_value = "kernel-service/data/audit-overflow.jsonl")]
    audit_overflow_path: PathBuf,
    /// Persistence backend for entries/jobs/audit mirroring. `auto` picks postgres
    /// when a database url is configured, otherwise runs in-memory only.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "KERNEL_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for the entries/jobs/audit_log mirror.
    #[arg(long, env = "KERNEL_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections for the mirror.
    #[arg(long, default_value_t = 5, env = "KERNEL_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli.database_url.clone().or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url
                .ok_or_else(|| anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL"))?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "kernel_service=info,info".to_string()))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let mut kernel_config = KernelConfig::default();
    kernel_config.storage = storage;
    let config = ServiceConfig {
        kernel: kernel_config,
        audit_overflow_path: cli.audit_overflow_path,
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("kernel-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
