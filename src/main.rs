use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use ara_delivery_service::broker::{create_broker, ConsumerConfig};
use ara_delivery_service::config::Settings;
use ara_delivery_service::dispatcher::{RecipientDirectory, ReconcileTask, StaticDirectory};
use ara_delivery_service::postgres::PostgresPool;
use ara_delivery_service::provider::create_provider;
use ara_delivery_service::redis::{CircuitBreaker, CircuitBreakerConfig, RedisPool};
use ara_delivery_service::server::{create_app, AppState};
use ara_delivery_service::shutdown::GracefulShutdown;
use ara_delivery_service::store::create_job_store;
use ara_delivery_service::telemetry::init_telemetry;
use ara_delivery_service::worker::{JobProcessor, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; the guard flushes spans on exit
    let _telemetry = init_telemetry(&settings.otel, &settings.log)?;
    tracing::info!("Configuration loaded");

    // Job store
    let postgres_pool = if settings.store.backend == "postgres" {
        let pool = PostgresPool::new(&settings.database).await?;
        if settings.database.run_migrations {
            pool.migrate().await?;
        }
        Some(pool)
    } else {
        None
    };
    let store = create_job_store(&settings.store, postgres_pool);

    // Queue broker
    let redis_pool = if settings.broker.backend == "redis" {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig::from(&settings.redis));
        let pool = RedisPool::new(settings.redis.clone(), Arc::new(breaker))?;
        if let Err(e) = pool.ping().await {
            tracing::warn!(error = %e, "Redis not reachable at startup, will retry on demand");
        }
        Some(Arc::new(pool))
    } else {
        None
    };
    let broker = create_broker(&settings.broker, redis_pool.clone());

    // Transport
    let provider = create_provider(
        &settings.provider,
        Duration::from_millis(settings.worker.send_timeout_ms),
    )?;
    let check = provider.test_connection().await;
    if !check.ok {
        tracing::warn!(
            provider = provider.name(),
            error = ?check.error,
            "Provider connection check failed, sends will be retried"
        );
    }

    // Recipient directory for filter-based submissions
    let directory: Arc<dyn RecipientDirectory> = match &settings.directory.path {
        Some(path) => {
            let directory = StaticDirectory::from_file(path)?;
            tracing::info!(path = %path, entries = directory.len(), "Recipient directory loaded");
            Arc::new(directory)
        }
        None => Arc::new(StaticDirectory::new(Vec::new())),
    };

    // Create application state
    let mut state = AppState::new(
        settings.clone(),
        store.clone(),
        broker.clone(),
        provider.clone(),
        directory,
    );
    if let Some(pool) = &redis_pool {
        state = state.with_redis_pool(pool.clone());
    }
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    // Start worker loops in background
    if settings.worker.enabled {
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            state.templates.clone(),
            provider.clone(),
            &settings.worker,
        ));
        let pool = WorkerPool::new(
            broker.clone(),
            processor,
            ConsumerConfig::from(&settings.broker),
            settings.worker.job_concurrency,
        );
        tasks.extend(pool.spawn(&shutdown_tx));
    } else {
        tracing::info!("Worker loops disabled in this process");
    }

    // Start reconciliation task in background
    let reconcile = ReconcileTask::new(
        &settings.broker,
        state.dispatcher.clone(),
        shutdown_tx.subscribe(),
    );
    tasks.push(tokio::spawn(reconcile.run()));

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    // Drain workers and background tasks
    let result = GracefulShutdown::new(broker, shutdown_tx)
        .execute("signal", tasks)
        .await;
    if !result.success {
        tracing::warn!(
            aborted = result.tasks_aborted,
            "Some tasks were aborted; their jobs will be redelivered"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
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
