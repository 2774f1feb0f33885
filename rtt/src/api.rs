use crate::config::Listener as ListenerConfig;
use crate::import::Importer;
use crate::resolver::{ProximityResolver, ResolveError};
use crate::types::ServerAddress;
use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State},
    http::{Extensions, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub resolver: ProximityResolver,
    // Absent when no analytical source is configured.
    pub importer: Option<Arc<Importer>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/resolve", get(resolve_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/admin/import/day", post(import_day_handler))
        .route("/admin/import/daily", post(import_daily_handler))
        .route("/admin/import/all", post(import_all_handler))
        .with_state(state)
}

pub async fn serve(listener: ListenerConfig, state: AppState) -> Result<(), ApiError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct ApiResponse {
    site: String,
    fqdn: String,
    ip: String,
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

impl From<ServerAddress> for ApiResponse {
    fn from(server: ServerAddress) -> Self {
        ApiResponse {
            ip: server.to_string(),
            site: server.site_id,
            fqdn: server.fqdn,
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error_message: message,
        }),
    )
        .into_response()
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        let status = match self {
            ResolveError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            ResolveError::InsufficientData => StatusCode::NOT_FOUND,
            ResolveError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        error_response(status, self.to_string())
    }
}

#[derive(Deserialize, Debug)]
struct ResolveParams {
    ip: Option<String>,
    service: String,
}

async fn resolve_handler(
    State(state): State<AppState>,
    Query(params): Query<ResolveParams>,
    extensions: Extensions,
) -> Result<ApiResponse, ResolveError> {
    // Without an explicit address the caller is resolved by its own.
    let ip = match params.ip {
        Some(ip) => ip,
        None => extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default(),
    };
    state
        .resolver
        .resolve(&ip, &params.service)
        .await
        .map(|server| server.into())
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    match state.resolver.check_store().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

fn importer(state: &AppState) -> Result<Arc<Importer>, Response> {
    state.importer.clone().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no query source configured".into(),
        )
    })
}

#[derive(Deserialize, Debug)]
struct DayParams {
    date: NaiveDate,
}

// Import triggers only start the run; progress is reported through logs.
async fn import_day_handler(
    State(state): State<AppState>,
    Query(params): Query<DayParams>,
) -> Result<StatusCode, Response> {
    let importer = importer(&state)?;
    tokio::spawn(async move {
        if let Err(err) = importer.import_day(params.date).await {
            tracing::error!(day = %params.date, error = %err, "import failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn import_daily_handler(State(state): State<AppState>) -> Result<StatusCode, Response> {
    let importer = importer(&state)?;
    tokio::spawn(async move {
        if let Err(err) = importer.import_daily(Utc::now()).await {
            tracing::error!(error = %err, "daily import failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn import_all_handler(State(state): State<AppState>) -> Result<StatusCode, Response> {
    let importer = importer(&state)?;
    tokio::spawn(async move {
        importer.import_all(Utc::now()).await;
    });
    Ok(StatusCode::ACCEPTED)
}
