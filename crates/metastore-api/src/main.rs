//! metastore-api - compliance subscriber and replay service for metastore

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metastore_api::config::{AppConfig, StoreBackend};
use metastore_api::{router, AppState};
use metastore_db::{
    log_pool_metrics, Backends, BusConfig, Database, EventTransport, MemoryStore, MemoryTransport,
    PoolConfig,
};
use metastore_jobs::{
    ChangeNotifier, ComplianceChangeOrchestrator, ComplianceConfig, HttpLegalService, LegalConfig,
    LegalTagChangedReceiver, LegalTagConsistencyValidator, ReplayConfig, ReplayEvent,
    ReplayOrchestrator, SubscriberConfig, SubscriberManager, TracingAuditSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "metastore=info,tower_http=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "metastore_api=info,metastore_jobs=info,metastore_db=info,audit=info,tower_http=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("metastore-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = AppConfig::from_env()?;
    info!(
        backend = ?config.store_backend,
        tenants = ?config.tenants,
        "Configuration loaded"
    );

    let backends = match config.store_backend {
        StoreBackend::Postgres => {
            info!("Connecting to database...");
            let db = Database::connect_with_config(&config.database_url, PoolConfig::from_env())
                .await?
                .with_bus_config(BusConfig::from_env());
            log_pool_metrics(&db.pool);

            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database migrations complete");
            Backends::postgres(&db)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory backends, nothing survives a restart");
            Backends::memory(Arc::new(MemoryStore::new()), MemoryTransport::new())
        }
    };

    let subscriber_config = SubscriberConfig::from_env();
    let compliance_config = ComplianceConfig::from_env();
    let replay_config = ReplayConfig::from_env();

    if config.provision_topics {
        let topics = [
            subscriber_config.topic.as_str(),
            compliance_config.topic.as_str(),
            replay_config.replay_topic.as_str(),
            replay_config.reindex_topic.as_str(),
        ];
        provision_topics(backends.transport.as_ref(), &config.tenants, &topics).await?;
    }

    let notifier =
        ChangeNotifier::with_batch_size(backends.transport.clone(), config.notification_batch_size);
    let audit = Arc::new(TracingAuditSink);

    // Compliance pipeline
    let legal = Arc::new(HttpLegalService::new(LegalConfig::from_env())?);
    let compliance = Arc::new(ComplianceChangeOrchestrator::new(
        backends.records.clone(),
        backends.tag_index.clone(),
        notifier.clone(),
        audit.clone(),
        compliance_config,
    ));
    let receiver = Arc::new(LegalTagChangedReceiver::new(
        LegalTagConsistencyValidator::new(legal),
        compliance,
    ));

    // Replay
    let replay = ReplayOrchestrator::new(
        backends.records.clone(),
        backends.replays.clone(),
        notifier,
        audit,
        replay_config,
    );
    for tenant in &config.tenants {
        match replay.recover_interrupted(tenant).await {
            Ok(0) => {}
            Ok(n) => warn!(partition_id = %tenant, count = n, "Failed interrupted replays"),
            Err(e) => error!(partition_id = %tenant, error = %e, "Replay recovery failed"),
        }
    }
    let replay_rx = replay.events();
    tokio::spawn(async move {
        log_replay_events(replay_rx).await;
    });

    // Subscriptions
    let manager = SubscriberManager::new(backends.transport.clone(), receiver, subscriber_config);
    let subscriptions = manager.start(&config.tenants).await;

    let app = router(AppState { replay });

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(count = subscriptions.len(), "Stopping subscriptions");
    for handle in subscriptions {
        let name = handle.subscription().to_string();
        if let Err(e) = handle.shutdown().await {
            error!(subscription = %name, error = %e, "Subscription did not stop cleanly");
        }
    }
    info!("Shutdown complete");

    Ok(())
}

/// Create `topics` for every tenant.
async fn provision_topics(
    transport: &dyn EventTransport,
    tenants: &[String],
    topics: &[&str],
) -> metastore_db::Result<()> {
    for tenant in tenants {
        for topic in topics {
            if !transport.topic_exists(tenant, topic).await? {
                transport.create_topic(tenant, topic).await?;
                info!(partition_id = %tenant, topic = %topic, "Created topic");
            }
        }
    }
    Ok(())
}

/// Log replay lifecycle events until the orchestrator goes away.
async fn log_replay_events(mut rx: broadcast::Receiver<ReplayEvent>) {
    loop {
        match rx.recv().await {
            Ok(ReplayEvent::Started {
                replay_id,
                total_records,
            }) => {
                info!(replay_id = %replay_id, total_records, "Replay started");
            }
            Ok(ReplayEvent::Progress { .. }) => {}
            Ok(ReplayEvent::Finished { replay_id, state }) => {
                info!(replay_id = %replay_id, state = %state, "Replay finished");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Replay event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
