use identity_service::{
    build_router,
    config::{CacheBackend, IdentityConfig, InboxBackend, StoreBackend},
    db,
    services::{
        bootstrap, metrics::init_metrics, CacheInboxStore, Database, EmailProvider, EmailService,
        IdentityStore, InMemoryCache, InboxStore, MemoryStore, MessagePublisher,
        MockEmailService, OutboxProcessor, OutboxStore, RecordingPublisher, RedisService,
        RedisStreamPublisher, TrustCache,
    },
    workers::{MaintenanceSettings, MaintenanceWorker},
    AppState,
};
use service_core::error::{set_expose_internal_details, AppError};
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Durable state behind its three seams.
struct Stores {
    identity: Arc<dyn IdentityStore>,
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics().map_err(AppError::ConfigError)?;
    set_expose_internal_details(config.security.expose_error_details);

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let stores = match config.database.backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.into()))?;
            let database = Arc::new(Database::new(pool));
            Stores {
                identity: database.clone(),
                outbox: database.clone(),
                inbox: database,
            }
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory identity store");
            let memory = Arc::new(MemoryStore::new());
            Stores {
                identity: memory.clone(),
                outbox: memory.clone(),
                inbox: memory,
            }
        }
    };

    let (cache, publisher): (Arc<dyn TrustCache>, Arc<dyn MessagePublisher>) =
        match config.redis.backend {
            CacheBackend::Redis => {
                let redis = RedisService::new(&config.redis)
                    .await
                    .map_err(AppError::InternalError)?;
                let publisher: Arc<dyn MessagePublisher> =
                    Arc::new(RedisStreamPublisher::new(redis.connection()));
                let cache: Arc<dyn TrustCache> = Arc::new(redis);
                (cache, publisher)
            }
            CacheBackend::Memory => {
                tracing::warn!("Using in-memory cache; outbox messages are only recorded");
                let cache: Arc<dyn TrustCache> = Arc::new(InMemoryCache::new());
                let publisher: Arc<dyn MessagePublisher> = Arc::new(RecordingPublisher::new());
                (cache, publisher)
            }
        };
    tracing::info!("Trust cache initialized");

    let inbox_store: Arc<dyn InboxStore> = match config.inbox.backend {
        InboxBackend::Database => stores.inbox,
        InboxBackend::Cache => Arc::new(CacheInboxStore::new(cache.clone())),
    };

    let email: Arc<dyn EmailProvider> = if config.smtp.host.is_some() {
        Arc::new(EmailService::new(&config.smtp)?)
    } else {
        tracing::warn!("SMTP_HOST not set; emails are logged, not sent");
        Arc::new(MockEmailService::new())
    };

    let state = AppState::new(
        config.clone(),
        stores.identity.clone(),
        cache.clone(),
        inbox_store,
        email,
    )?;

    bootstrap::seed(
        &state.roles,
        &state.users,
        config
            .rbac
            .admin_roles
            .first()
            .map(String::as_str)
            .unwrap_or("admin"),
        &config.bootstrap,
    )
    .await?;

    // Background workers
    let shutdown = CancellationToken::new();
    let mut workers = Arc::new(OutboxProcessor::new(
        stores.outbox.clone(),
        publisher,
        config.outbox.clone(),
    ))
    .start(shutdown.clone());
    workers.push(
        Arc::new(MaintenanceWorker::new(
            stores.identity,
            stores.outbox,
            state.inbox.clone(),
            cache,
            MaintenanceSettings {
                interval_seconds: config.rbac.maintenance_interval_seconds,
                outbox_cleanup_after_days: config.outbox.cleanup_after_days,
                stale_claim_seconds: config.outbox.stale_claim_seconds,
            },
        ))
        .start(shutdown.clone()),
    );

    let app = build_router(state)?;

    let addr: SocketAddr = config
        .common
        .bind_address()
        .parse()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e)))?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    let drain = futures::future::join_all(workers);
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("Background workers did not stop in time");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
