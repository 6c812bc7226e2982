use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::NewsError;
use crate::model::NewsItem;
use crate::ratelimit::{middleware::rate_limit, RateLimiter};
use crate::service::{NewsService, PageQuery, RefreshRequest};
use crate::store::Page;

#[derive(Clone)]
pub struct AppState {
    pub service: NewsService,
    pub limiter: Arc<RateLimiter>,
}

pub fn create_router(state: AppState) -> Router {
    let limiter = Arc::clone(&state.limiter);
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/news", get(list_news))
        .route("/api/headlines", get(headlines))
        .route("/api/status", get(status))
        .route("/api/refresh", get(refresh))
        .route("/api/categories", get(categories))
        .layer(middleware::from_fn_with_state(limiter, rate_limit))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

impl IntoResponse for NewsError {
    fn into_response(self) -> Response {
        let status = match &self {
            NewsError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            NewsError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            NewsError::Validation(_) => StatusCode::BAD_REQUEST,
            NewsError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, kind = self.kind().as_str(), "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.kind().as_str(),
            "message": self.to_string(),
        }));
        let mut resp = (status, body).into_response();
        if let NewsError::RateLimited { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

/// `?sources=a,b` → `["a", "b"]`.
fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsQuery {
    sources: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_news(
    State(state): State<AppState>,
    Query(q): Query<NewsQuery>,
) -> Result<Json<Page>, NewsError> {
    let page = state
        .service
        .list_page(&PageQuery {
            sources: split_csv(q.sources.as_deref()),
            category: q.category,
            limit: q.limit,
            offset: q.offset,
        })
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadlinesQuery {
    sources: Option<String>,
    limit: Option<usize>,
    retention_days: Option<u32>,
}

#[derive(Serialize)]
struct HeadlinesOut {
    items: Vec<NewsItem>,
}

async fn headlines(
    State(state): State<AppState>,
    Query(q): Query<HeadlinesQuery>,
) -> Result<Json<HeadlinesOut>, NewsError> {
    let items = state
        .service
        .headlines(&split_csv(q.sources.as_deref()), q.limit, q.retention_days)
        .await?;
    Ok(Json(HeadlinesOut {
        items: items.as_ref().clone(),
    }))
}

async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, NewsError> {
    Ok(Json(state.service.status().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshQuery {
    sources: Option<String>,
    limit: Option<usize>,
    retention_days: Option<u32>,
    /// Defaults to a live fetch.
    force: Option<bool>,
}

async fn refresh(
    State(state): State<AppState>,
    Query(q): Query<RefreshQuery>,
) -> Result<impl IntoResponse, NewsError> {
    let out = state
        .service
        .refresh(&RefreshRequest {
            sources: split_csv(q.sources.as_deref()),
            limit: q.limit,
            retention_days: q.retention_days,
            force: q.force.unwrap_or(true),
        })
        .await?;
    Ok(Json(out))
}

#[derive(Debug, Default, Deserialize)]
struct CategoriesQuery {
    sources: Option<String>,
}

#[derive(Serialize)]
struct CategoriesOut {
    categories: Vec<String>,
}

async fn categories(
    State(state): State<AppState>,
    Query(q): Query<CategoriesQuery>,
) -> Result<Json<CategoriesOut>, NewsError> {
    let categories = state
        .service
        .categories(&split_csv(q.sources.as_deref()))
        .await?;
    Ok(Json(CategoriesOut { categories }))
}
