use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use doc_convert::{
    analytics::SqliteAnalytics,
    artifacts::run_artifact_sweeper,
    config::Config,
    convex::ConvexClient,
    dispatch::{ChannelAdapter, ChannelRunner, Dispatcher, LogChannel, TelegramChannel},
    ledger::UsageLedger,
    pdf::{CommandEngine, DocumentEngine},
    pipeline::Pipeline,
    queue::{JobQueue, RetryPolicy},
    quota::QuotaGate,
    router::build_router,
    state::AppState,
    store::Store,
    users::ConvexUserDirectory,
    worker::{ConversionWorker, WorkerPool, WorkerSettings},
};
use serde_json::json;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;
    let settings = config.pipeline.clone();

    for dir in [&config.upload_dir, &config.result_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let store = Store::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    let convex = ConvexClient::new(config.convex_url.clone())?;
    match convex.query::<String>("health:get", json!({})).await {
        Ok(value) => {
            tracing::info!(convex_health = %value, "Convex connectivity check passed");
        }
        Err(error) => {
            tracing::error!(
                error = ?error,
                convex_url = %config.convex_url,
                "Convex connectivity check failed. User lookups will fail and submissions will be refused until it is reachable."
            );
        }
    }

    if config.intake_api_key.is_none() {
        tracing::warn!("INTAKE_API_KEY is not set. Intake routes will refuse every request.");
    }

    let adapter: Arc<dyn ChannelAdapter> = match config.telegram_bot_token.clone() {
        Some(token) => Arc::new(TelegramChannel::new(config.telegram_api_base.clone(), token)?),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN is not set. Outbound messages will only be logged.");
            Arc::new(LogChannel)
        }
    };
    let (dispatcher, outbound_rx) = Dispatcher::channel(OUTBOUND_CHANNEL_CAPACITY);
    let channel_task = tokio::spawn(
        ChannelRunner::new(adapter, config.premium_upgrade_url.clone()).run(outbound_rx),
    );

    let queue = JobQueue::new(
        store.clone(),
        RetryPolicy {
            max_attempts: settings.max_attempts,
            backoff: settings.retry_backoff,
        },
    );
    let engine: Arc<dyn DocumentEngine> = Arc::new(CommandEngine {
        converter_bin: config.converter_bin.clone(),
        qpdf_bin: config.qpdf_bin.clone(),
        command_timeout: settings.hard_time_limit,
    });
    let pipeline = Pipeline::new(
        Arc::new(ConvexUserDirectory::new(convex)),
        QuotaGate::new(UsageLedger::new(store.clone()), settings.daily_free_limit),
        queue.clone(),
        engine.clone(),
        dispatcher.clone(),
    );

    let pool = WorkerPool::new(Arc::new(ConversionWorker::new(
        queue,
        engine,
        Arc::new(SqliteAnalytics::new(store.clone())),
        dispatcher,
        config.result_dir.clone(),
        WorkerSettings {
            concurrency: settings.worker_concurrency,
            soft_time_limit: settings.soft_time_limit,
            hard_time_limit: settings.hard_time_limit,
            poll_interval: settings.poll_interval,
            reaper_interval: settings.reaper_interval,
            log_task_queue_timings: config.log_task_queue_timings,
        },
    )));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_tasks = pool.spawn(shutdown_rx);

    tokio::spawn(run_artifact_sweeper(
        vec![config.upload_dir.clone(), config.result_dir.clone()],
        settings.artifact_retention,
        settings.sweep_interval,
    ));

    let state = AppState::new(config.clone(), store, pipeline);
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(None);
            }
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    }

    tracing::info!("Intake stopped. Waiting for workers to finish their current jobs.");
    let _ = shutdown_tx.send(true);
    for task in worker_tasks {
        if let Err(error) = task.await {
            tracing::error!(error = %error, "worker task failed");
        }
    }
    // The router and the pool held the last dispatcher clones; the adapter
    // drains what is left and exits.
    drop(pool);
    if let Err(error) = channel_task.await {
        tracing::error!(error = %error, "channel adapter task failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received.");
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
