use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use cronkeeper_agent::{LlmProvider, OpenAiProvider};
use cronkeeper_core::config::{CronkeeperConfig, Transport};
use cronkeeper_scheduler::{
    ExecutorRegistry, ExecutorSettings, SchedulerContext, SchedulerEngine, SchedulerSettings,
    TaskService,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod app;
mod http;
mod rpc;
mod stdio;

/// Cron-style task scheduler with a JSON-RPC management surface.
#[derive(Debug, Parser)]
#[command(name = "cronkeeper", version, about)]
struct Cli {
    /// Config file (default: $CRONKEEPER_CONFIG or ~/.cronkeeper/cronkeeper.toml)
    #[arg(long, short)]
    config: Option<String>,

    /// Bind address for the HTTP transport
    #[arg(long)]
    address: Option<String>,

    /// Port for the HTTP transport
    #[arg(long, short)]
    port: Option<u16>,

    /// stdio or http
    #[arg(long, short)]
    transport: Option<Transport>,

    /// Log level filter, e.g. `debug` or `cronkeeper_scheduler=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<String>,

    /// SQLite database path (`:memory:` for a throwaway store)
    #[arg(long)]
    db_path: Option<String>,

    /// Default model for `ai` tasks
    #[arg(long)]
    ai_model: Option<String>,
}

impl Cli {
    /// Flags win over every other configuration layer.
    fn apply(&self, config: &mut CronkeeperConfig) {
        if let Some(address) = &self.address {
            config.server.bind = address.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(transport) = self.transport {
            config.server.transport = transport;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if let Some(model) = &self.ai_model {
            config.ai.model = model.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: explicit path > CRONKEEPER_CONFIG env > ~/.cronkeeper/cronkeeper.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRONKEEPER_CONFIG").ok());
    let (mut config, load_error) = match CronkeeperConfig::load(config_path.as_deref()) {
        Ok(c) => (c, None),
        Err(e) => (CronkeeperConfig::default(), Some(e)),
    };
    cli.apply(&mut config);

    init_tracing(&config)?;
    if let Some(e) = load_error {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
    }

    // scheduler context: store, execution log and executors share one database
    let provider = build_provider(&config);
    let executors = ExecutorSettings::from_config(&config.scheduler, &config.ai);
    let registry = ExecutorRegistry::with_defaults(&executors, provider);
    let ctx = SchedulerContext::open(
        &config.database.path,
        SchedulerSettings::from(&config.scheduler),
        registry,
    )?;
    ctx.recover()?;

    let state = Arc::new(app::AppState::new(config, TaskService::new(ctx.clone())));

    // spawn scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let engine = tokio::spawn(SchedulerEngine::new(ctx).run(shutdown_rx.clone()));

    let on_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = on_signal.send(true);
        }
    });

    let served = match state.config.server.transport {
        Transport::Stdio => stdio::serve(state.clone(), shutdown_rx).await,
        Transport::Http => serve_http(state.clone(), shutdown_rx).await,
    };

    // the transport may also end on its own (stdin EOF); stop the loop either way
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine.await {
        warn!(error = %e, "scheduler engine task failed");
    }
    info!("cronkeeper stopped");
    served
}

async fn serve_http(
    state: Arc<app::AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", state.config.server.bind, state.config.server.port).parse()?;
    let router = app::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("cronkeeper listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

/// Console logs always go to stderr; stdout belongs to the stdio transport.
fn init_tracing(config: &CronkeeperConfig) -> anyhow::Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let file = match &config.logging.file {
        Some(path) => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(f))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}

/// OpenAI-compatible provider for `ai` tasks, if a key is configured.
fn build_provider(config: &CronkeeperConfig) -> Option<Arc<dyn LlmProvider>> {
    match config.ai.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => {
            info!(base_url = %config.ai.base_url, model = %config.ai.model, "LLM provider: OpenAI-compatible");
            Some(Arc::new(OpenAiProvider::new(
                key.to_string(),
                Some(config.ai.base_url.clone()),
            )))
        }
        None => {
            warn!("No AI provider configured; ai tasks will fail until ai.api_key is set");
            None
        }
    }
}
