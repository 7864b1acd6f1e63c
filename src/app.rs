use crate::config::{Config, StoreBackend};
use crate::counter::VisitCounter;
use crate::error::{CounterError, FailureReason};
use crate::identity::resolve_identity;
use crate::store::{MemoryTableStore, TableStore};
use crate::table::{StorageAccount, TableClient};
use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

const MAX_BODY_BYTES: usize = 16 * 1024;
const NO_STORE: &str = "no-store, no-cache, must-revalidate";

#[derive(Clone)]
pub struct AppState {
    /// `None` when the store could not be configured.
    pub counter: Option<Arc<VisitCounter>>,
}

impl AppState {
    pub fn new(counter: VisitCounter) -> Self {
        Self {
            counter: Some(Arc::new(counter)),
        }
    }

    pub fn unconfigured() -> Self {
        Self { counter: None }
    }
}

/// Outcome of a counter request as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterResponse {
    Success { count: u64 },
    Failure { reason: FailureReason },
}

/// Wire shape of a counter response.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CounterBody {
    Count { count: u64 },
    Failure { count: &'static str, error: &'static str },
}

impl IntoResponse for CounterResponse {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            CounterResponse::Success { count } => (StatusCode::OK, CounterBody::Count { count }),
            CounterResponse::Failure { reason } => {
                let status = match reason {
                    FailureReason::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = CounterBody::Failure {
                    count: "N/A",
                    error: reason.message(),
                };
                (status, body)
            }
        };
        let mut res = (status, Json(body)).into_response();
        apply_counter_headers(res.headers_mut());
        res
    }
}

fn apply_counter_headers(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
}

/// Build the shared state. Problems with the store credential are logged and
/// leave the state unconfigured rather than aborting startup.
pub async fn build_state(config: &Config) -> AppState {
    let store: Arc<dyn TableStore> = match config.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory table store; counts are lost on restart");
            Arc::new(MemoryTableStore::new())
        }
        StoreBackend::Azure => {
            let Some(conn) = config.connection_string.as_deref() else {
                error!("COSMOS_CONNECTION_STRING environment variable not found");
                return AppState::unconfigured();
            };
            let client = match StorageAccount::from_connection_string(conn).and_then(|account| {
                TableClient::new(account, &config.table_name, config.store_timeout)
            }) {
                Ok(c) => c,
                Err(e) => {
                    error!("Unusable table configuration: {:#}", e);
                    return AppState::unconfigured();
                }
            };
            match client.ensure_table().await {
                Ok(true) => info!("Created table {}", client.table_name()),
                Ok(false) => info!("Using existing table {}", client.table_name()),
                Err(e) => warn!("Could not ensure table {} exists: {:#}", client.table_name(), e),
            }
            Arc::new(client)
        }
    };
    AppState::new(VisitCounter::new(store, config.window))
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = build_state(&config).await;
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let counter = get(update_counter)
        .post(update_counter)
        .options(preflight)
        .fallback(method_not_allowed);
    Router::new()
        .route("/updateCounter", counter.clone())
        .route("/api/updateCounter", counter)
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn preflight() -> Response {
    let mut res = StatusCode::OK.into_response();
    let headers = res.headers_mut();
    apply_counter_headers(headers);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Accept, Origin"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("3600"));
    res
}

async fn method_not_allowed() -> CounterResponse {
    CounterResponse::Failure {
        reason: FailureReason::MethodNotAllowed,
    }
}

async fn update_counter(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<CounterResponse, CounterError> {
    let counter = state.counter.as_ref().ok_or(CounterError::Configuration)?;
    let identity = resolve_identity(&headers);
    info!("Processing request from IP: {}", identity);

    let outcome = counter.evaluate_visit(&identity, Utc::now()).await?;
    Ok(CounterResponse::Success {
        count: outcome.count,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
