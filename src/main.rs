use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webhook_triage::config::Config;
use webhook_triage::dispatcher::{DispatchError, Dispatcher};
use webhook_triage::github::GitHubIssueClient;
use webhook_triage::llm::ChatModelClient;
use webhook_triage::processor::Processor;
use webhook_triage::stats::Stats;
use webhook_triage::templates::PromptStore;
use webhook_triage::worker::run_dispatch_worker;
use triage_core::policy::RepositoryTable;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<Stats>,
    worker_alive: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Arc::new(Config::from_env().context("load triage config")?);
    let repositories = Arc::new(
        RepositoryTable::load(&config.repositories_file).context("load repository policies")?,
    );
    let prompts = Arc::new(PromptStore::load(&config.prompts_dir).context("load prompt templates")?);
    info!(
        repositories = repositories.len(),
        templates = prompts.len(),
        "triage configuration loaded"
    );

    let model = Arc::new(ChatModelClient::from_config(&config).context("build model client")?);
    let github = Arc::new(GitHubIssueClient::from_config(&config).context("build github client")?);
    let stats = Arc::new(Stats::new());

    let processor = Arc::new(Processor::new(
        prompts,
        model,
        github,
        config.clone(),
        stats.clone(),
    ));

    let worker_alive = Arc::new(AtomicBool::new(true));
    let (queue, worker_handle) = if config.async_processing {
        let (tx, rx) = mpsc::channel(config.dispatch_queue_capacity);
        let alive = worker_alive.clone();
        let worker_processor = processor.clone();
        let handle = tokio::spawn(async move {
            run_dispatch_worker(rx, worker_processor).await;
            alive.store(false, Ordering::SeqCst);
        });
        (Some(tx), Some(handle))
    } else {
        (None, None)
    };

    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        repositories,
        processor,
        queue,
        stats.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
        stats,
        worker_alive,
    });

    let period_ms = ip_refill_period_ms(config.ip_limit_per_minute);
    let mut governor_builder = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .use_headers();
    governor_builder
        .per_millisecond(period_ms)
        .burst_size(config.ip_limit_per_minute)
        .methods(vec![Method::POST]);
    let governor_config = Arc::new(
        governor_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("build governor config"))?,
    );

    let app = Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health))
        .route("/stats", get(stats_handler))
        .layer(DefaultBodyLimit::max(config.max_payload_bytes))
        .layer(GovernorLayer::new(governor_config))
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;

    info!(bind = %config.bind_addr, "webhook triage listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    server.await.context("serve webhook triage")?;

    drop(state);
    if let Some(handle) = worker_handle {
        handle.abort();
        let _ = handle.await;
    }

    Ok(())
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match state.dispatcher.dispatch(&headers, &body).await {
        Ok(result) => (StatusCode::OK, Json(json!(result))),
        Err(error) => {
            let status = match error {
                DispatchError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
                DispatchError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            };
            (
                status,
                Json(json!({"status": "error", "error": error.message()})),
            )
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.config.async_processing && !state.worker_alive.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status":"degraded","reason":"dispatch worker not running"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.stats.snapshot()))
}

fn ip_refill_period_ms(limit_per_minute: u32) -> u64 {
    if limit_per_minute == 0 {
        return 1;
    }

    let period = 60_000u64 / u64::from(limit_per_minute);
    period.max(1)
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
