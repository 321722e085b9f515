mod config;
mod orchestrator;
mod runner;
mod staging;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dockyard_common::blob::{BlobStore, FsBlobStore};
use dockyard_common::redis as dyredis;
use orchestrator::Orchestrator;
use runner::SandboxRunner;
use staging::RetryPolicy;
use tokio::signal;
use tracing::{error, info, instrument, warn};
use workspace::{EvictionPolicy, WorkspaceCache};

use crate::config::ToolchainManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Dockyard worker booting...");

    // Load toolchain configurations
    let toolchains = ToolchainManager::load_default().map_err(|e| {
        error!("Failed to load toolchain configurations: {}", e);
        error!("Make sure config/languages.json exists");
        e
    })?;
    info!("Loaded toolchains for: {:?}", toolchains.list_languages());

    // Blob store backing project files
    let blob_root = std::env::var("BLOB_ROOT").unwrap_or_else(|_| "/var/lib/dockyard/blobs".to_string());
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(PathBuf::from(&blob_root)));
    info!("Blob store root: {}", blob_root);

    // Connect to Redis
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", redis_url);

    // Execution orchestrator over ephemeral staging directories
    let staging_root = std::env::var("STAGING_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("dockyard-staging"));
    let runner = SandboxRunner::new()?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        runner,
        toolchains,
        staging_root,
    ));

    // Persistent workspace cache with its background eviction sweep
    let workspace_root = std::env::var("WORKSPACE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/dockyard/workspaces"));
    let cache = Arc::new(WorkspaceCache::new(
        Arc::clone(&store),
        workspace_root,
        RetryPolicy::default(),
        EvictionPolicy::default(),
    ));
    let eviction_task = Arc::clone(&cache).spawn_eviction_task(Duration::from_secs(10 * 60));

    // Setup graceful shutdown
    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal, draining queue...");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &orchestrator) => {},
        _ = shutdown => {},
    }

    eviction_task.abort();
    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    orchestrator: &Arc<Orchestrator>,
) -> anyhow::Result<()> {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match dyredis::pop_run(redis_conn, 5.0).await {
            Ok(Some(request)) => {
                info!(
                    execution_id = %request.id,
                    language = %request.language,
                    file_path = %request.file_path,
                    has_stdin = request.stdin.is_some(),
                    "Received run request"
                );

                // Each execution is its own task: staging directories are
                // private per execution id, so unrelated runs never block
                // each other.
                let orchestrator = Arc::clone(orchestrator);
                let mut conn = redis_conn.clone();
                tokio::spawn(async move {
                    let start = std::time::Instant::now();
                    match orchestrator.run(&mut conn, &request).await {
                        Ok(record) => {
                            info!(
                                execution_id = %record.id,
                                status = %record.status,
                                exit_code = ?record.exit_code,
                                wall_ms = start.elapsed().as_millis() as u64,
                                "Run finished"
                            );
                        }
                        Err(e) => {
                            error!(execution_id = %request.id, error = %e, "Run failed");
                        }
                    }
                });
            }
            Ok(None) => {
                // Timeout - loop around and check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
