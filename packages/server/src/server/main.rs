// Main entry point for the tagging service.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::kernel::jobs::{create_redis_pool, JobQueue, WorkerConfig};
use server_core::kernel::scheduler::SchedulerConfig;
use server_core::kernel::{
    AuditStore, BaseCatalog, BaseCheckout, BaseFileExplorer, BaseTagModel, BusPublisher,
    CatalogClient, EventAdmission, FileExplorerClient, GitCheckout, ModelClient, Notifier,
    RedisBusPublisher, RedisJobQueue, TagJobProcessor, TagScheduler, TagWorker, TaggingDeps,
};
use server_core::{server::build_app, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting repository tagging service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Open the audit store (runs migrations) and seal orphaned runs
    let store = Arc::new(
        AuditStore::connect(&config.database_path)
            .await
            .context("Failed to open audit store")?,
    );
    store
        .reap_orphaned_runs()
        .await
        .context("Failed to reap orphaned runs")?;
    tracing::info!(path = %config.database_path, "Audit store ready");

    // Connect to Redis (queue + outbound bus + inbound subscription)
    let redis_pool = create_redis_pool(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let redis_client = redis::Client::open(config.redis_url.clone())
        .context("Failed to create Redis subscriber client")?;

    let queue = Arc::new(RedisJobQueue::new(redis_pool.clone()));
    let queue_dyn: Arc<dyn JobQueue> = queue.clone();

    // External collaborators
    let catalog: Arc<dyn BaseCatalog> = Arc::new(
        CatalogClient::new(&config.catalog_base_url, &config.catalog_token)
            .context("Failed to create catalog client")?,
    );
    let file_explorer: Arc<dyn BaseFileExplorer> = Arc::new(
        FileExplorerClient::new(
            &config.file_explorer_base_url,
            config.file_explorer_token.clone(),
        )
        .context("Failed to create file explorer client")?,
    );
    let model: Arc<dyn BaseTagModel> = Arc::new(
        ModelClient::new(&config.ai_connector_base_url, &config.ai_connector_model)
            .context("Failed to create model client")?,
    );
    let checkout: Arc<dyn BaseCheckout> =
        Arc::new(GitCheckout::new(config.workspace_root.clone()));

    let bus: Arc<dyn BusPublisher> = Arc::new(RedisBusPublisher::new(redis_pool.clone()));
    let notifier = Arc::new(
        Notifier::new(bus, &config.events_channel, config.webhook_url.clone())
            .context("Failed to create notifier")?,
    );

    let deps = Arc::new(TaggingDeps::new(
        store.clone(),
        catalog.clone(),
        file_explorer.clone(),
        model,
        checkout,
        notifier.clone(),
        config.prompt_template_path.clone(),
    ));
    let processor = Arc::new(TagJobProcessor::new(deps));

    let shutdown = CancellationToken::new();

    // Event admission
    let admission = Arc::new(EventAdmission::new(queue_dyn.clone(), store.clone()));
    let admission_handle = tokio::spawn(admission.run(
        redis_client,
        config.events_channel.clone(),
        shutdown.child_token(),
    ));

    // Scheduler backstop
    let scheduler = Arc::new(TagScheduler::new(
        catalog,
        queue_dyn.clone(),
        store.clone(),
        SchedulerConfig::default(),
    ));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.child_token()));

    // Worker
    let worker = TagWorker::with_config(
        queue_dyn.clone(),
        processor,
        WorkerConfig::with_concurrency(config.tagging_concurrency),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown.child_token()));

    // Mirror queue transitions onto the events channel
    let relay_handle = {
        let notifier = notifier.clone();
        let transitions = queue.subscribe();
        let token = shutdown.child_token();
        tokio::spawn(async move { notifier.relay_queue_transitions(transitions, token).await })
    };

    // Trigger shutdown on ctrl-c
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Read API
    let app = build_app(store.clone(), queue_dyn.clone(), file_explorer.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/healthz", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    // The HTTP server is down; stop the background services too.
    shutdown.cancel();
    let (admission_res, scheduler_res, worker_res, relay_res) = tokio::join!(
        admission_handle,
        scheduler_handle,
        worker_handle,
        relay_handle
    );
    for res in [admission_res, scheduler_res, worker_res] {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "service ended with error"),
            Err(err) => tracing::error!(error = %err, "service task panicked"),
        }
    }
    if let Err(err) = relay_res {
        tracing::error!(error = %err, "relay task panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
