use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use ara_message_cache::config::Settings;
use ara_message_cache::notifier::NotificationBus;
use ara_message_cache::persister::{create_durable_store, CoordinatorConfig, PersistenceCoordinator};
use ara_message_cache::postgres::PostgresPool;
use ara_message_cache::queue::create_cache_backends;
use ara_message_cache::redis::{CircuitBreaker, CircuitBreakerConfig, RedisHealth, RedisPool};
use ara_message_cache::server::{create_app, AppState};
use ara_message_cache::shutdown::GracefulShutdown;
use ara_message_cache::tasks::{PersisterTask, TopologyWatcherTask};
use ara_message_cache::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Arc::new(Settings::new()?);

    // Initialize tracing; the guard flushes spans on exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(run_mode = %std::env::var("RUN_MODE").unwrap_or_default(), "Configuration loaded");

    // Redis pool, only when the Redis backend is selected
    let redis_pool = if settings.cache.backend == "redis" {
        let circuit_breaker = Arc::new(CircuitBreaker::with_config(
            "redis",
            CircuitBreakerConfig::from(&settings.redis),
        ));
        let pool = RedisPool::new(
            settings.redis.clone(),
            circuit_breaker,
            Arc::new(RedisHealth::new()),
        )?;
        match pool.ping().await {
            Ok(()) => tracing::info!(cluster = pool.is_cluster(), "Redis connection verified"),
            Err(e) => tracing::warn!(error = %e, "Redis not reachable yet, continuing"),
        }
        Some(Arc::new(pool))
    } else {
        None
    };

    // Queue store and keyspace notifications
    let backends = create_cache_backends(&settings, redis_pool.clone());
    let store = backends.store;
    let bus = NotificationBus::new(backends.subscriber, settings.notifier.clone());
    bus.start().await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut shutdown = GracefulShutdown::new(bus.clone(), shutdown_tx.clone());

    // Durable handoff
    let postgres_pool = if settings.persister.enabled && settings.persister.durable_backend == "postgres" {
        let pool = PostgresPool::connect(&settings.database, Arc::new(CircuitBreaker::new("postgres"))).await?;
        tracing::info!(url = %pool.database_url_masked(), "PostgreSQL pool connected");
        Some(pool)
    } else {
        None
    };

    if settings.persister.enabled {
        let durable = create_durable_store(&settings.persister, postgres_pool.clone()).await?;
        let coordinator = Arc::new(PersistenceCoordinator::new(
            store.clone(),
            durable,
            CoordinatorConfig::from_settings(&settings.cache, &settings.persister),
        ));

        let persister_task = PersisterTask::new(
            settings.persister.clone(),
            coordinator.clone(),
            shutdown_tx.subscribe(),
        );
        shutdown.track(tokio::spawn(async move {
            persister_task.run().await;
        }));
        shutdown = shutdown.with_final_sweep(coordinator);
    } else {
        tracing::info!("Persister disabled");
    }

    // Cluster topology polling
    if redis_pool.is_some() && settings.redis.topology_refresh_interval_seconds > 0 {
        let watcher = TopologyWatcherTask::new(
            Duration::from_secs(settings.redis.topology_refresh_interval_seconds),
            bus.clone(),
            shutdown_tx.subscribe(),
        );
        shutdown.track(tokio::spawn(async move {
            watcher.run().await;
        }));
    }

    // Create Axum app
    let state = AppState::new(settings.clone(), store, bus)
        .with_redis(redis_pool)
        .with_postgres(postgres_pool);
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    shutdown.execute("server shutdown").await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
