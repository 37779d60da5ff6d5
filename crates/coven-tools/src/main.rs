// ABOUTME: coven-tools CLI entry point.
// ABOUTME: Runs the supervisor daemon and talks to a running one over its control socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coven_tools::logging::{self, LogFormat};
use coven_tools::ports::{BindProbe, PortAllocator};
use coven_tools::{orphans, store, Config, ReconcileTrigger, Supervisor, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "coven-tools")]
#[command(about = "Supervisor for store-configured MCP tool processes")]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "COVEN_TOOLS_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon
    Run {
        /// Terminate leftover proxy processes from a previous run before starting
        #[arg(long)]
        reap_orphans: bool,
    },
    /// Ask a running supervisor to reconcile now
    Trigger,
    /// Show running tools and the last reconcile/status results
    Status,
    /// Run a health check on a running supervisor
    Health,
    /// Print a free port from the configured range
    AllocatePort,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Commands::Init { force } => run_init(cli.config.as_deref(), force),
        Commands::Run { reap_orphans } => {
            let config = load_config(cli.config.as_deref())?;
            run_daemon(config, reap_orphans).await
        }
        Commands::AllocatePort => {
            let config = load_config(cli.config.as_deref())?;
            allocate_port(&config).await
        }
        Commands::Trigger => {
            let config = load_config(cli.config.as_deref())?;
            client::send(&config.socket_path(), client::Kind::Reconcile).await
        }
        Commands::Status => {
            let config = load_config(cli.config.as_deref())?;
            client::send(&config.socket_path(), client::Kind::Status).await
        }
        Commands::Health => {
            let config = load_config(cli.config.as_deref())?;
            client::send(&config.socket_path(), client::Kind::Health).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load_or_default(path).context("Failed to load configuration")
}

fn run_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    println!("Set store.url and store.key (or SUPABASE_URL / SUPABASE_KEY) before running.");
    Ok(())
}

async fn allocate_port(config: &Config) -> Result<()> {
    let store = store::from_config(config)?;
    let allocator = PortAllocator::new(
        &config.ports,
        store,
        Arc::new(SystemClock),
        Arc::new(BindProbe),
    );
    match allocator.allocate().await {
        Some(port) => {
            println!("{}", port);
            Ok(())
        }
        None => anyhow::bail!(
            "No free port available in range {}-{}",
            config.ports.start,
            config.ports.end
        ),
    }
}

async fn run_daemon(config: Config, reap_orphans: bool) -> Result<()> {
    tracing::info!(
        runner_dir = %config.runner_dir().display(),
        ports = %format!("{}-{}", config.ports.start, config.ports.end),
        store = ?config.store.kind,
        "Starting coven-tools supervisor"
    );

    if reap_orphans || config.supervisor.reap_orphans_on_start {
        let reaped = orphans::reap_orphans(
            config.supervisor.proxy_binary.clone(),
            config.ports.start..=config.ports.end,
        )
        .await;
        tracing::info!(count = reaped.len(), "Orphan sweep complete");
    }

    let supervisor = Supervisor::from_config(&config).context("Failed to build supervisor")?;
    let (trigger, triggers) = ReconcileTrigger::channel();
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(32);
    let cancel = CancellationToken::new();

    #[cfg(unix)]
    let socket = {
        let path = config.socket_path();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                coven_tools::socket::run_socket_server(path, trigger, cmd_tx, cancel).await
            {
                tracing::error!(error = %e, "Control socket failed");
            }
        })
    };
    #[cfg(not(unix))]
    let _ = (trigger, cmd_tx);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    supervisor.run(triggers, cmd_rx, cancel.clone()).await;

    cancel.cancel();
    #[cfg(unix)]
    let _ = socket.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(unix)]
mod client {
    use anyhow::Result;
    use coven_tools::socket::{Request, SocketClient};
    use std::path::Path;

    pub enum Kind {
        Reconcile,
        Status,
        Health,
    }

    pub async fn send(path: &Path, kind: Kind) -> Result<()> {
        let request = match kind {
            Kind::Reconcile => Request::Reconcile,
            Kind::Status => Request::Status,
            Kind::Health => Request::Health,
        };
        let mut client = SocketClient::connect(path).await?;
        let response = client.request(&request).await?;

        if !response.success {
            anyhow::bail!(
                "Supervisor error: {}",
                response.error.unwrap_or_else(|| "unknown".into())
            );
        }
        match response.data {
            Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
            None => println!("ok"),
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod client {
    use anyhow::Result;
    use std::path::Path;

    pub enum Kind {
        Reconcile,
        Status,
        Health,
    }

    pub async fn send(_path: &Path, _kind: Kind) -> Result<()> {
        anyhow::bail!("The control socket is only available on Unix")
    }
}
