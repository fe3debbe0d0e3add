use anyhow::{Context, Result};
use facegate_core::FaceComparator;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Subscriber;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter};

mod api;
mod config;
mod engine;
mod fetcher;
mod payload;
mod resolver;
mod scratch;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = config::Config::load().context("failed to load configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.mongo_db,
        collection = %config.voters_collection,
        scratch_dir = %config.scratch_dir.display(),
        model_dir = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        "facegated starting"
    );

    let store = store::MongoVoterStore::connect(
        &config.mongodb_uri,
        &config.mongo_db,
        &config.voters_collection,
    )
    .await
    .context("failed to configure voter store")?;
    let store: Arc<dyn store::VoterStore> = Arc::new(store);

    let scratch = scratch::ScratchDir::new(&config.scratch_dir);
    scratch
        .ensure()
        .await
        .with_context(|| format!("cannot create scratch directory {}", config.scratch_dir.display()))?;

    let comparator = FaceComparator::load_default(&config.model_dir)
        .context("failed to load face models")?;
    let engine = engine::spawn_engine(comparator).context("failed to start engine")?;

    let fetcher = fetcher::RemoteFetcher::new(Duration::from_secs(config.download_timeout_secs))
        .context("failed to build HTTP client")?;
    let resolver = resolver::ImageResolver::new(store.clone(), scratch.clone(), fetcher);

    let state = Arc::new(api::AppState {
        store,
        resolver,
        engine,
        scratch,
        similarity_threshold: config.similarity_threshold,
    });
    let app = api::router(state, config.max_body_bytes, &config.cors_allowed_origins);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(%addr, "facegated ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("facegated shutting down");
    Ok(())
}

/// Optional append-only log file, in addition to stderr.
const LOG_FILE_ENV: &str = "FACEGATE_LOG_FILE";

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = std::env::var_os(LOG_FILE_ENV)
        .map(|path| log_file_layer(Path::new(&path)))
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

type FileLayer<S> = fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, Mutex<File>>;

fn log_file_layer<S>(path: &Path) -> Result<FileLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    Ok(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
