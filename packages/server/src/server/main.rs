// Main entry point for the storyteller server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grimoire_core::ai::{AiObserver, OpenAiProducer};
use grimoire_core::jobs::{PostgresTaskQueue, TaskQueue, TaskRegistry, TaskWorker};
use grimoire_core::room::{CommandGateway, RoomConfig, RoomManager};
use grimoire_core::server::build_app;
use grimoire_core::server::middleware::JwtService;
use grimoire_core::store::PostgresEventStore;
use grimoire_core::tools::builtin_registry;
use grimoire_core::engine::Ruleset;
use grimoire_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,grimoire_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Grimoire storyteller server");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PostgresEventStore::new(pool.clone()));
    let manager = RoomManager::new(
        store,
        Ruleset::trouble_brewing(),
        RoomConfig {
            snapshot_interval: config.snapshot_interval,
        },
    );

    let jwt = Arc::new(JwtService::new(&config.jwt_secret, config.jwt_issuer.clone()));

    let shutdown = CancellationToken::new();

    // AI side-channel: only wired when a model key is configured. The
    // queue is optional on top of that; without it events are handled
    // synchronously inside the observer.
    if let Some(api_key) = config.openai_api_key.clone() {
        let gateway: Arc<dyn CommandGateway> = manager.clone();
        let tools = Arc::new(builtin_registry(gateway));
        let producer = Arc::new(OpenAiProducer::new(api_key, config.ai_model.clone()));

        let queue: Option<Arc<dyn TaskQueue>> = if config.ai_queue_enabled {
            Some(Arc::new(PostgresTaskQueue::new(pool.clone())))
        } else {
            None
        };

        let observer = AiObserver::new(
            tools,
            producer,
            queue.clone(),
            Duration::from_millis(config.ai_timeout_ms),
        );

        if let Some(queue) = queue {
            // Handlers registered before the worker starts delivering.
            let mut registry = TaskRegistry::new();
            observer.register_handler(&mut registry);
            let worker = TaskWorker::new(queue, Arc::new(registry));
            tokio::spawn(worker.run(shutdown.clone()));
        }

        manager.set_ai_observer(observer);
        tracing::info!(model = %config.ai_model, queue = config.ai_queue_enabled, "AI storyteller enabled");
    } else {
        tracing::info!("OPENAI_API_KEY not set; AI storyteller disabled");
    }

    let app = build_app(manager.clone(), jwt);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    manager.shutdown().await;
    Ok(())
}
