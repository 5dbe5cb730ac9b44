use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    roost_common::{HealthMonitor, ObserverHook, ObserverRegistry},
    roost_gateway::AppState,
    roost_hub::{AllowAllMembership, Hub, HubContext, MemoryMessageStore, RateLimiter},
    roost_presence::{MemoryPresenceBus, PresenceBus, RedisPresenceBus},
};

#[derive(Parser)]
#[command(name = "roost", about = "Roost — real-time chat hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config file path (overrides discovery).
    #[arg(long, global = true, env = "ROOST_CONFIG")]
    config: Option<PathBuf>,

    /// Treat an unreachable bus at startup as fatal.
    #[arg(long, global = true, default_value_t = false)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default when no subcommand is provided).
    Serve,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "roost starting");

    match &cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => roost_config::load_config(path)?,
        None => roost_config::discover_and_load(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.strict {
        config.bus.strict = true;
    }

    let bus: Arc<dyn PresenceBus> =
        match RedisPresenceBus::connect(&config.bus.url, config.bus.command_timeout()).await {
            Ok(bus) => Arc::new(bus),
            Err(e) if config.bus.strict => {
                anyhow::bail!("presence bus unreachable at {}: {e}", config.bus.url);
            },
            Err(e) => {
                warn!(
                    url = %config.bus.url,
                    error = %e,
                    "presence bus unreachable, falling back to in-process bus \
                     (single-instance mode, no cross-instance fan-out)"
                );
                Arc::new(MemoryPresenceBus::new())
            },
        };

    let health = Arc::new(HealthMonitor::new());
    let mut observers = ObserverRegistry::new();
    observers.register(Arc::clone(&health) as Arc<dyn ObserverHook>);
    let observers = Arc::new(observers);

    // Collaborator stand-ins; a deployment replaces these with the real
    // relational store and membership authority.
    let store = Arc::new(MemoryMessageStore::new());
    let membership = Arc::new(AllowAllMembership);

    let (hub, handle) = Hub::new(HubContext {
        store,
        membership,
        bus: Arc::clone(&bus),
        observers,
        config: config.clone(),
    });
    let hub_task = tokio::spawn(hub.run());

    let limiter = Arc::new(RateLimiter::new(bus, config.rate_limit));
    let state = AppState {
        hub: handle.clone(),
        limiter,
        health,
        verifier: None,
        config: Arc::new(config.clone()),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let result = roost_gateway::serve(
        state,
        &config.server.bind,
        config.server.port,
        shutdown.clone(),
    )
    .await;

    handle.shutdown();
    if tokio::time::timeout(config.server.shutdown_timeout(), handle.stopped())
        .await
        .is_err()
    {
        warn!("hub did not stop within the shutdown deadline");
    }
    let _ = hub_task.await;

    result
}
