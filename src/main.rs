//! Isolate - sandbox session orchestrator with HTTP API.
//!
//! Usage:
//!   isolate serve [--port 8080] [--config isolate.json]   # Start HTTP server
//!   isolate runtimes [--config isolate.json]              # Check registered runtimes

use clap::{Parser, Subcommand, ValueEnum};
use isolate_orchestrator::config::{LockPolicy, ServiceConfig, StoreKind};
use isolate_orchestrator::http_server;
use isolate_orchestrator::runtime::container::ContainerBackend;
use isolate_orchestrator::runtime::process::ProcessBackend;
use isolate_orchestrator::session::spawn_sweeper;
use isolate_orchestrator::state::AppState;
use isolate_orchestrator::store::{MemoryKeyValueStore, MemorySessionStore, SharedSessionStore};
use isolate_orchestrator::{ExecutionBackend, RuntimeSelector, SessionManager, SessionStore};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "isolate")]
#[command(about = "Sandbox session orchestrator with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Session store backend
        #[arg(long, value_enum)]
        store: Option<StoreArg>,

        /// Locking granularity of the memory store
        #[arg(long, value_enum)]
        lock_policy: Option<LockPolicyArg>,

        /// Seconds between expiry sweeps
        #[arg(long)]
        sweep_interval: Option<u64>,

        /// Directory that holds process sandboxes
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Print the registered runtimes and their availability as JSON
    Runtimes {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreArg {
    Memory,
    Keyvalue,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LockPolicyArg {
    ProcessWide,
    PerKey,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve {
            port,
            config,
            store,
            lock_policy,
            sweep_interval,
            workspace,
        } => {
            let mut service = load_config(config);
            if let Some(port) = port {
                service.port = port;
            }
            if let Some(store) = store {
                service.store = match store {
                    StoreArg::Memory => StoreKind::Memory,
                    StoreArg::Keyvalue => StoreKind::Keyvalue,
                };
            }
            if let Some(policy) = lock_policy {
                service.lock_policy = match policy {
                    LockPolicyArg::ProcessWide => LockPolicy::ProcessWide,
                    LockPolicyArg::PerKey => LockPolicy::PerKey,
                };
            }
            if let Some(secs) = sweep_interval {
                service.sweep_interval_secs = secs;
            }
            if let Some(dir) = workspace {
                service.workspace_base = dir;
            }
            serve(service).await
        }
        Commands::Runtimes { config } => {
            let service = load_config(config);
            let selector = selector(&service);
            match selector.describe(&CancellationToken::new()).await {
                Ok(runtimes) => match serde_json::to_string_pretty(&runtimes) {
                    Ok(json) => {
                        println!("{}", json);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e.to_string()),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> ServiceConfig {
    match path {
        Some(path) => match ServiceConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: failed to load {}: {}", path.display(), e);
                exit(1);
            }
        },
        None => ServiceConfig::default(),
    }
}

fn selector(service: &ServiceConfig) -> RuntimeSelector {
    let backends: Vec<Arc<dyn ExecutionBackend>> = vec![
        Arc::new(ContainerBackend::new(
            service.container_binary.clone(),
            service.container_images.clone(),
        )),
        Arc::new(ProcessBackend::new(service.workspace_base.join("isolate"))),
    ];
    RuntimeSelector::with_cache_ttl(backends, service.manager.availability_cache_ttl())
}

async fn serve(service: ServiceConfig) -> Result<(), String> {
    service
        .session_defaults
        .validate()
        .map_err(|e| format!("session_defaults: {}", e))?;

    let store: Arc<dyn SessionStore> = match service.store {
        StoreKind::Memory => Arc::new(MemorySessionStore::new(service.lock_policy)),
        StoreKind::Keyvalue => {
            warn!("Key-value store is in-process; sessions are not shared across instances");
            Arc::new(
                SharedSessionStore::new(Arc::new(MemoryKeyValueStore::new()))
                    .with_prefix(service.key_prefix.clone())
                    .with_lock_ttl(service.lock_ttl()),
            )
        }
    };
    let manager = Arc::new(SessionManager::new(
        Arc::new(selector(&service)),
        store,
        service.manager.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(&manager),
        service.sweep_interval(),
        shutdown.child_token(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    });

    let state = AppState::with_shutdown(Arc::clone(&manager), shutdown.clone())
        .with_session_defaults(service.session_defaults.clone());
    let served = http_server::run_server(service.port, state).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task failed");
    }
    manager.shutdown().await;
    served.map_err(|e| e.to_string())
}
