//! HTTP API for similar-product search.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/similar_products` | Products most similar to a free-text query |
//! | `GET`  | `/api/health_status` | Health check |
//!
//! # Request
//!
//! ```json
//! { "query": "steel kettle", "limit": 10, "threshold": 0.5 }
//! ```
//!
//! `limit` must be non-negative and `threshold` within `[-1, 1]`; both are
//! optional and default to the `[search]` settings.
//!
//! # Responses
//!
//! Success is `201` with the result under `data`:
//!
//! ```json
//! { "message": "Query Similar Products successful",
//!   "data": { "similar_products": [..], "query": "..", "created_date": "..", "modified_date": ".." } }
//! ```
//!
//! Errors share one shape:
//!
//! ```json
//! { "message": "Query Embedding failed",
//!   "error": { "message": "Query Embedding failed", "code": "QUERY_EMBEDDING_FAILED" } }
//! ```
//!
//! Codes: `INVALID_REQUEST_BODY` (400), `QUERY_EMBEDDING_FAILED`,
//! `QUERY_SIMILAR_PRODUCTS_FAILED`, `FETCH_SIMILAR_PRODUCTS_FAILED` and
//! `UNK` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::search::{SearchError, SearchService, SimilarProductsResponse};

#[derive(Clone)]
struct AppState {
    search: Arc<SearchService>,
}

/// Build the API router around a search service.
pub fn build_router(search: Arc<SearchService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    Router::new()
        .route("/api/similar_products", post(handle_similar_products))
        .route("/api/health_status", get(handle_health))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { search })
}

/// `psearch serve`: bind to `[server].bind` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let search = Arc::new(SearchService::from_config(config)?);
    let app = build_router(search.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "API server listening");
    println!("API server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    search.close().await;
    Ok(())
}

// ============ Response envelope ============

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    code: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: self.message.clone(),
            error: ErrorDetail {
                message: self.message,
                code: self.code,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn invalid_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "INVALID_REQUEST_BODY".to_string(),
        message: message.into(),
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: err.code().to_string(),
            message: err.message().to_string(),
        }
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Request handler panicked");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "UNK".to_string(),
        message: "Internal server error".to_string(),
    }
    .into_response()
}

// ============ GET /api/health_status ============

async fn handle_health() -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        message: "Health status OK".to_string(),
        data: None,
    })
}

// ============ POST /api/similar_products ============

#[derive(Debug, Deserialize)]
struct SimilarProductsRequest {
    query: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    threshold: Option<f64>,
}

impl SimilarProductsRequest {
    fn validate(&self) -> Result<(Option<f64>, Option<usize>), AppError> {
        let limit = match self.limit {
            Some(l) if l < 0 => return Err(invalid_request("limit must be non-negative")),
            Some(l) => Some(l as usize),
            None => None,
        };
        if let Some(t) = self.threshold {
            if !(-1.0..=1.0).contains(&t) {
                return Err(invalid_request("threshold must be between -1 and 1"));
            }
        }
        Ok((self.threshold, limit))
    }
}

async fn handle_similar_products(
    State(state): State<AppState>,
    payload: Result<Json<SimilarProductsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<SimilarProductsResponse>>), AppError> {
    let Json(request) = payload.map_err(|e| invalid_request(e.body_text()))?;
    let (threshold, limit) = request.validate()?;

    let response = state
        .search
        .similar_products(&request.query, threshold, limit)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            message: "Query Similar Products successful".to_string(),
            data: Some(response),
        }),
    ))
}
