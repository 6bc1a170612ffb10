mod api;
mod middleware;
mod pipeline;
mod scheduler;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use voc_db::{JobQueue, PgJobQueue, PgStore, QueueName, Store};
use voc_pipeline::{spawn_pool, CrawlScheduler, SchedulerConfig, WorkerConfig};

use crate::api::{build_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(voc_core::load_app_config()?);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::info!(env = %config.env, bind_addr = %config.bind_addr, "starting voc-server");

    let pool_config = voc_db::PoolConfig::from_app_config(&config);
    let pool = voc_db::connect_pool(&config.database_url, pool_config).await?;
    let applied = voc_db::run_migrations(&pool).await?;
    tracing::info!(applied, "migrations complete");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone()));

    let ctx = Arc::new(pipeline::build_context(
        &config,
        Arc::clone(&store),
        Arc::clone(&queue),
    )?);
    let seeded = ctx.classifier.seed_taxonomy().await?;
    tracing::info!(themes = seeded.len(), "system themes seeded");

    let crawls = Arc::new(CrawlScheduler::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        SchedulerConfig::from_app_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_config = WorkerConfig::from_app_config(&config);
    let mut workers = Vec::new();
    for (queue_name, size) in [
        (QueueName::Crawl, config.crawl_concurrency),
        (QueueName::Processing, config.processing_workers),
        (QueueName::Alert, config.alert_workers),
    ] {
        tracing::info!(queue = %queue_name, workers = size, "starting worker pool");
        workers.extend(spawn_pool(
            Arc::clone(&ctx),
            queue_name,
            size,
            worker_config,
            shutdown_rx.clone(),
        ));
    }

    // A pending row idle for a full visibility window has no live job.
    let sweep_idle = chrono::Duration::from_std(worker_config.visibility)
        .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let mut cron = scheduler::build_scheduler(
        Arc::clone(&crawls),
        Arc::clone(&ctx),
        &config.alert_eval_cron,
        sweep_idle,
    )
    .await?;

    let app = build_app(AppState {
        scheduler: crawls,
        pool: Some(pool),
    });
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = cron.shutdown().await {
        tracing::warn!(error = %e, "cron scheduler did not shut down cleanly");
    }
    shutdown_tx.send_replace(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
