//! Bootstrap (C9): parses the CLI, loads configuration, opens the key
//! store, wires the shared services, and spawns the three listeners plus
//! the Monitor.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::Instrument;

use hive_core::config::Config;
use hive_core::keystore::{Role, SqliteKeyStore};
use hive_core::queue::DispatchQueue;
use hive_core::worker::Roster;
use hive_core::{admin, intake, monitor};

#[derive(Parser, Debug)]
#[command(name = "hived", about = "Reverse-proxy dispatcher for polling inference workers")]
struct Cli {
    /// Path to the config file; created with defaults if absent.
    #[arg(long, default_value = "hive.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::load_or_init(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let keystore = match SqliteKeyStore::open(&config.database_url) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open key store");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = seed_admin_key_if_empty(&keystore) {
        tracing::error!(error = %e, "failed to seed initial admin key");
        return ExitCode::FAILURE;
    }

    let worker_listener = match TcpListener::bind(("0.0.0.0", config.node_connection_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.node_connection_port, "failed to bind worker port");
            return ExitCode::FAILURE;
        }
    };
    let proxy_listener = match TcpListener::bind(("0.0.0.0", config.proxy_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.proxy_port, "failed to bind proxy port");
            return ExitCode::FAILURE;
        }
    };
    let admin_listener =
        match TcpListener::bind(("0.0.0.0", config.management_connection_port)).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, port = config.management_connection_port, "failed to bind admin port");
                return ExitCode::FAILURE;
            }
        };

    let queue = Arc::new(DispatchQueue::new());
    let roster = Arc::new(Roster::new());
    let next_task_id = Arc::new(AtomicU64::new(1));

    tokio::spawn(run_worker_acceptor(
        worker_listener,
        Arc::clone(&queue),
        Arc::clone(&roster),
        Arc::clone(&keystore),
        config.connection_exception_threshold,
        config.message_chunk_buffer_size,
    ));

    tokio::spawn(intake::run(
        proxy_listener,
        Arc::clone(&queue),
        Arc::clone(&keystore),
        Arc::new(intake::IntakeConfig {
            user_authentication: config.user_authentication,
            read_timeout: std::time::Duration::from_millis(config.proxy_timeout_ms),
        }),
        next_task_id,
    ));

    tokio::spawn(admin::run(
        admin_listener,
        Arc::clone(&queue),
        Arc::clone(&roster),
        Arc::clone(&keystore),
    ));

    tokio::spawn(monitor::run(
        Arc::clone(&roster),
        Arc::clone(&queue),
        monitor::DEFAULT_PERIOD,
        config.polling_node_connection_timeout,
        config.working_node_connection_timeout,
    ));

    tracing::info!(
        proxy_port = config.proxy_port,
        worker_port = config.node_connection_port,
        admin_port = config.management_connection_port,
        "hived is running"
    );

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl-c handler; shutting down anyway");
    }
    tracing::info!("shutdown signal received, exiting");
    ExitCode::SUCCESS
}

async fn run_worker_acceptor(
    listener: TcpListener,
    queue: Arc<DispatchQueue>,
    roster: Arc<Roster>,
    keystore: Arc<SqliteKeyStore>,
    exception_threshold: u32,
    chunk_buffer_size: usize,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "worker accept failed");
                continue;
            }
        };
        let queue = Arc::clone(&queue);
        let roster = Arc::clone(&roster);
        let keystore = Arc::clone(&keystore);
        let session_config = hive_core::worker::SessionConfig {
            exception_threshold,
            chunk_buffer_size,
        };
        let span = tracing::info_span!("worker", addr = %peer);
        tokio::spawn(
            async move {
                if let Err(e) = hive_core::worker::run_session(
                    stream,
                    peer,
                    keystore,
                    queue,
                    roster,
                    session_config,
                )
                .await
                {
                    tracing::debug!(error = %e, "worker session ended");
                }
            }
            .instrument(span),
        );
    }
}

fn seed_admin_key_if_empty(keystore: &SqliteKeyStore) -> hive_core::Result<()> {
    if keystore.is_empty()? {
        let value = keystore.insert("bootstrap-admin", Role::Admin)?;
        tracing::info!(token = %value, "seeded initial admin key");
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
