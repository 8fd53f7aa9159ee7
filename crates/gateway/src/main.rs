use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use tracing_subscriber::EnvFilter;

use sb_allocator::WorkerAllocator;
use sb_domain::config::{Config, ConfigSeverity};
use sb_gateway::api;
use sb_gateway::api::auth::ApiKeyMap;
use sb_gateway::cli::{load_config, Cli, Command, ConfigCommand};
use sb_gateway::events::{self, EventHub, RedisStatusSink};
use sb_gateway::state::AppState;
use sb_gateway::supervisor::{
    watchdog, ContainerRuntime, DockerRuntime, RedisPool, Supervisor, WebhookNotifier,
};
use sb_meetings::MeetingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = load_config(cli.config.as_deref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = load_config(cli.config.as_deref())?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("{} OK", config_path.display());
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = load_config(cli.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("stenobot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sb_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the control plane with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Stenobot starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── API keys (owner resolution) ──────────────────────────────────
    let api_keys = Arc::new(ApiKeyMap::from_env(&config.server.api_keys_env));

    // ── Bot token secret ─────────────────────────────────────────────
    let token_secret = match std::env::var("SB_BOT_TOKEN_SECRET") {
        Ok(secret) if !secret.is_empty() => secret.into_bytes(),
        _ => {
            tracing::warn!(
                "SB_BOT_TOKEN_SECRET not set; using a random secret — bot \
                 callbacks will not survive a control-plane restart"
            );
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    };

    // ── Redis (allocator registry + event bus) ───────────────────────
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .context("parsing redis URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client.clone())
        .await
        .context("connecting to redis")?;
    tracing::info!(url = %config.redis.url, "registry connection ready");

    // ── Event bus publisher + status sink ────────────────────────────
    let publisher = events::start_publisher(redis_conn.clone());
    let sink = Arc::new(RedisStatusSink::new(publisher.clone()));

    // ── Meeting registry ─────────────────────────────────────────────
    let meetings = Arc::new(MeetingStore::new(&config.store.state_path, sink));

    // ── Worker allocator + reaper ────────────────────────────────────
    let allocator = WorkerAllocator::new(redis_conn.clone());
    {
        let allocator = allocator.clone();
        let period = Duration::from_secs(config.timing.reaper_period_secs);
        tokio::spawn(async move {
            sb_allocator::run_reaper(allocator, period).await;
        });
    }
    let pool = Arc::new(RedisPool::new(
        allocator.clone(),
        config.limits.worker_capacity,
    ));
    tracing::info!(
        capacity = config.limits.worker_capacity,
        "worker allocator ready"
    );

    // ── Container runtime ────────────────────────────────────────────
    let docker = Arc::new(DockerRuntime::connect(&config.docker)?);
    match docker.ping().await {
        Ok(()) => tracing::info!(image = %config.docker.image, "container runtime ready"),
        Err(e) => tracing::warn!(error = %e, "container runtime unreachable at startup"),
    }

    // ── Supervisor ───────────────────────────────────────────────────
    let webhooks = WebhookNotifier::new(reqwest::Client::new(), &config.webhook);
    let supervisor = Supervisor::new(
        config.clone(),
        meetings.clone(),
        docker,
        pool,
        publisher,
        webhooks,
        token_secret,
    );
    supervisor.restore();

    // ── Watchdog ─────────────────────────────────────────────────────
    {
        let supervisor = supervisor.clone();
        let period = Duration::from_secs(config.timing.watchdog_period_secs);
        tokio::spawn(async move {
            watchdog::run_watchdog(supervisor, period).await;
        });
    }
    tracing::info!(
        period_secs = config.timing.watchdog_period_secs,
        "container watchdog started"
    );

    // ── Event hub + bus bridge ───────────────────────────────────────
    let hub = Arc::new(EventHub::new(config.limits.subscriber_queue_depth));
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            events::run_bridge(redis_client, hub).await;
        });
    }
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            events::run_pruner(hub, Duration::from_secs(60)).await;
        });
    }

    // ── App state + router ───────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        meetings,
        supervisor,
        hub,
        api_keys,
        http: reqwest::Client::new(),
        started_at: chrono::Utc::now(),
    };

    let app = api::router()
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Stenobot listening");

    // Bot containers outlive the control plane on purpose: the registry
    // reloads from disk and the watchdog re-adopts them on restart.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    tracing::info!("Stenobot stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl-c received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
