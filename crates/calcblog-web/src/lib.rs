//! Axum admin/query API over the content store, plus the public blog page.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use calcblog_core::{
    blog_url, BlogError, BlogFilter, BlogPatch, BlogStatus, PageRequest, SettingsPatch,
    SourceKind,
};
use calcblog_storage::ContentStore;
use calcblog_sync::{BlogPipeline, DraftGenerator, GenerationOverrides};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calcblog-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContentStore>,
    pub generator: Arc<DraftGenerator>,
    pub pipeline: Arc<BlogPipeline>,
    /// When set, `POST /api/cron/run` requires `Authorization: Bearer <secret>`.
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<BlogPipeline>, cron_secret: Option<String>) -> Self {
        Self {
            store: pipeline.store().clone(),
            generator: pipeline.generator().clone(),
            pipeline,
            cron_secret: cron_secret.filter(|s| !s.is_empty()),
        }
    }
}

/// JSON error body `{"error": reason}` with a status derived from the error kind.
#[derive(Debug)]
pub enum ApiError {
    Blog(BlogError),
    Unauthorized,
}

impl From<BlogError> for ApiError {
    fn from(err: BlogError) -> Self {
        Self::Blog(err)
    }
}

impl From<calcblog_storage::StoreError> for ApiError {
    fn from(err: calcblog_storage::StoreError) -> Self {
        Self::Blog(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::Blog(err) => {
                let status = match &err {
                    BlogError::NotFound(_) => StatusCode::NOT_FOUND,
                    BlogError::AlreadyExists(_) => StatusCode::CONFLICT,
                    BlogError::Invalid(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": reason }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    source_url: String,
    #[serde(default)]
    force: bool,
    tone: Option<String>,
    audience: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    status: Option<String>,
    kind: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

impl ListQuery {
    fn filter(&self) -> Result<BlogFilter, BlogError> {
        let status = non_empty(&self.status)
            .map(str::parse::<BlogStatus>)
            .transpose()?;
        let kind = non_empty(&self.kind)
            .map(str::parse::<SourceKind>)
            .transpose()?;
        Ok(BlogFilter { status, kind })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: BlogStatus,
}

#[derive(Template)]
#[template(path = "blog_post.html")]
struct BlogPostTemplate {
    title: String,
    meta_title: String,
    meta_desc: String,
    keywords: String,
    canonical_url: String,
    site_url: String,
    site_name: String,
    source_link: String,
    published: String,
    html: String,
    json_ld: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/blogs", get(list_blogs_handler))
        .route("/api/blogs/generate", post(generate_handler))
        .route("/api/blogs/slug/{slug}", get(blog_by_slug_handler))
        .route(
            "/api/blogs/{id}",
            patch(update_blog_handler).delete(delete_blog_handler),
        )
        .route("/api/blogs/{id}/status", patch(update_status_handler))
        .route(
            "/api/settings",
            get(get_settings_handler).put(put_settings_handler),
        )
        .route("/api/sources/unblogged", get(unblogged_sources_handler))
        .route("/api/cron/run", post(cron_run_handler))
        .route("/blog/{slug}", get(blog_page_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("CALCBLOG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(state, port).await
}

fn parse_id(raw: &str) -> Result<Uuid, BlogError> {
    Uuid::parse_str(raw).map_err(|_| BlogError::Invalid(format!("`{raw}` is not a blog id")))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /api/blogs/generate`: 201 with the blog, 404 for an unknown source.
///
/// An existing blog yields 409 unless `force` is set. A source whose last attempt
/// FAILED is regenerated without `force`.
async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<impl IntoResponse> {
    let overrides = GenerationOverrides {
        tone: req.tone,
        audience: req.audience,
    };
    let record = state
        .generator
        .generate_on_demand(&req.source_url, req.force, &overrides)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_blogs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.filter()?;
    let page = PageRequest::new(query.page, query.limit);
    Ok(Json(state.store.list_blogs(filter, page).await?))
}

async fn blog_by_slug_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .store
        .find_published_blog_by_slug(&slug)
        .await?
        .ok_or_else(|| BlogError::NotFound(format!("blog `{slug}`")))?;
    Ok(Json(record))
}

async fn update_blog_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(changes): Json<BlogPatch>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let mut record = state
        .store
        .get_blog(id)
        .await?
        .ok_or_else(|| BlogError::NotFound(format!("blog {id}")))?;
    changes.apply(&mut record, Utc::now());
    Ok(Json(state.store.save_blog_content(&record).await?))
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let record = state
        .store
        .update_blog_status(id, req.status, Utc::now())
        .await?;
    info!(blog_id = %id, status = %req.status.as_str(), "blog status changed");
    Ok(Json(record))
}

async fn delete_blog_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    state.store.delete_blog(id).await?;
    info!(blog_id = %id, "blog deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_settings_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.load_settings().await?))
}

async fn put_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(changes): Json<SettingsPatch>,
) -> ApiResult<impl IntoResponse> {
    let mut settings = state.store.load_settings().await?;
    changes.apply(&mut settings, Utc::now())?;
    Ok(Json(state.store.save_settings(&settings).await?))
}

async fn unblogged_sources_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_generation_candidates(None).await?))
}

async fn cron_run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    if let Some(secret) = &state.cron_secret {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(secret.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(Json(state.pipeline.run_once().await?))
}

async fn blog_page_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    let record = match state.store.find_published_blog_by_slug(&slug).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Html("Blog post not found".to_string())).into_response()
        }
        Err(err) => return server_error(err.into()),
    };

    let site = state.generator.site();
    let base = site.base_url.trim_end_matches('/');
    let json_ld = record
        .json_ld
        .as_ref()
        .map(|v| v.to_string().replace("</", "<\\/"))
        .unwrap_or_else(|| "{}".to_string());
    render_html(BlogPostTemplate {
        canonical_url: blog_url(base, &record.slug),
        site_url: base.to_string(),
        site_name: site.site_name.clone(),
        source_link: format!("{base}{}", record.source_url),
        published: record
            .published_at
            .map(|t| t.format("%-d %B %Y").to_string())
            .unwrap_or_default(),
        keywords: record.keywords.join(", "),
        title: record.title,
        meta_title: record.meta_title,
        meta_desc: record.meta_desc,
        html: record.html,
        json_ld,
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
