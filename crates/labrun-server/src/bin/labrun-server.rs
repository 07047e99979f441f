//! labrun-server binary entry point.
//!
//! Serves the REST API and the terminal WebSocket on one listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use labrun_server::config::{DEFAULT_BIND, DEFAULT_DATABASE, DEFAULT_RUNNER};
use labrun_server::pty::NativePtySpawner;
use labrun_server::store::Store;
use labrun_server::{build_router, AppState, ServerConfig};
use labrun_vault::Vault;

/// Streams Ansible playbook runs against lab systems to browser terminals.
#[derive(Parser, Debug)]
#[command(name = "labrun-server")]
#[command(version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LABRUN_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// SQLite database file
    #[arg(long, env = "LABRUN_DATABASE", default_value = DEFAULT_DATABASE)]
    database: PathBuf,

    /// Directory that receives per-run inventory and playbook files
    #[arg(long, env = "LABRUN_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// Secret the credential encryption key is derived from
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: String,

    /// Shell for terminal sessions (defaults to $SHELL, then bash, then sh)
    #[arg(long, env = "LABRUN_SHELL")]
    shell: Option<String>,

    /// Playbook runner command
    #[arg(long, env = "LABRUN_RUNNER", default_value = DEFAULT_RUNNER)]
    runner: String,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "LABRUN_ALLOW_ORIGINS", value_delimiter = ',', default_value = "*")]
    allow_origin: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let artifact_dir = match self.artifact_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        Ok(ServerConfig {
            bind: self.bind,
            database: self.database,
            artifact_dir,
            encryption_key: self.encryption_key,
            shell: self.shell,
            runner: self.runner,
            allow_origins: self.allow_origin,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = args.into_config()?;

    info!(
        bind = %config.bind,
        database = %config.database.display(),
        artifact_dir = %config.artifact_dir.display(),
        runner = %config.runner,
        "Starting labrun-server"
    );

    let store = Store::open(&config.database)
        .with_context(|| format!("failed to open database {}", config.database.display()))?;
    let vault = Vault::from_secret(&config.encryption_key).context("invalid encryption key")?;
    let spawner = NativePtySpawner::new(config.shell.clone(), config.artifact_dir.clone());
    info!(shell = %spawner.shell(), "Terminal shell resolved");

    let state = AppState::new(
        &config,
        Arc::new(store),
        Arc::new(vault),
        Arc::new(spawner),
    );
    let app = build_router(state).layer(config.cors_layer()?);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("Listening on {}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
