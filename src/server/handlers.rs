//! Manual book API handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::app::App;
use crate::entity::{
    Entity, EntityFilter, META_GENERATED_AT, META_PDF_HASH, META_PDF_RELATIVE, META_PDF_VERSION,
};
use crate::error::LibritoError;
use crate::scheduler::SAVE_DELAY_SECS;
use crate::settings::StorageMode;
use crate::tokens::{TOKEN_CUSTOMER_NAME, TOKEN_ORDER_DATE, format_short_utc};

use super::state::AppState;

/// Signed download links handed out by the API stay valid this long.
const DOWNLOAD_TTL_SECS: u64 = 86_400;

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

/// Query parameters for GET /api/manuals.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub search: Option<String>,
    pub material: Option<String>,
    pub leather_type: Option<String>,
    /// Inclusive creation-date lower bound (YYYY-MM-DD).
    pub from: Option<String>,
    /// Inclusive creation-date upper bound (YYYY-MM-DD).
    pub to: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

impl ListQuery {
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.search.as_deref().unwrap_or(""),
            self.material.as_deref().unwrap_or(""),
            self.leather_type.as_deref().unwrap_or(""),
            self.from.as_deref().unwrap_or(""),
            self.to.as_deref().unwrap_or(""),
            self.page,
            self.per_page
        )
    }

    fn filter(&self) -> EntityFilter {
        let parse = |s: &Option<String>| {
            s.as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
        };
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        EntityFilter {
            search: non_empty(&self.search),
            material: non_empty(&self.material),
            leather_type: non_empty(&self.leather_type),
            from: parse(&self.from),
            to: parse(&self.to),
            status: None,
        }
    }
}

/// Form data for POST /api/manuals/:id/process.
#[derive(Debug, Deserialize)]
pub struct ProcessForm {
    /// Required customer name printed on the manual.
    pub customer_name: String,
    /// Order date; interpretation depends on `mode`.
    pub order_date: Option<String>,
    /// "now" (the default) stamps today; "choose" takes `order_date`.
    pub mode: Option<String>,
    /// Template id; the configured default when absent.
    pub template: Option<String>,
}

/// Form data for POST /api/manuals/:id/queue.
#[derive(Debug, Default, Deserialize)]
pub struct QueueForm {
    pub delay_secs: Option<u64>,
    pub force: Option<bool>,
}

/// Query parameters for GET /download.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub manual: String,
    pub exp: i64,
    pub sig: String,
}

/// Handle GET /api/manuals - filtered, paginated, cached listing.
pub async fn list(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let key = query.cache_key();
    if let Some(body) = state.cached_list(&key).await {
        return (StatusCode::OK, Json(body)).into_response();
    }

    let app = &state.app;
    let ids = match app.entities.list_ids(&query.filter()) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };

    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, 100);
    let total = ids.len();
    let start = (page - 1).saturating_mul(per_page).min(total);
    let end = (start + per_page).min(total);

    let mut items = Vec::with_capacity(end - start);
    for id in &ids[start..end] {
        if let Ok(Some(entity)) = app.entities.get(*id) {
            items.push(prepare_item(app, &entity));
        }
    }

    let body = json!({
        "items": items,
        "total": total,
        "page": page,
        "per_page": per_page,
    });
    state.store_list(key, body.clone()).await;
    (StatusCode::OK, Json(body)).into_response()
}

/// Handle GET /api/manuals/:id - single item summary.
pub async fn item(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.app.entities.get(id) {
        Ok(Some(entity)) if entity.is_serial() => {
            (StatusCode::OK, Json(prepare_item(&state.app, &entity))).into_response()
        }
        Ok(_) => not_found(id),
        Err(e) => error_response(&e),
    }
}

/// Handle GET /api/manuals/:id/preview - composed HTML preview.
pub async fn preview(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state
        .app
        .builder
        .compose_html(id, None, &BTreeMap::new())
        .await
    {
        Ok(html) => Html(html).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle POST /api/manuals/:id/build - immediate persisted build.
pub async fn build(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.app.builder.build(id, None, &BTreeMap::new(), true).await {
        Ok(_) => {
            state.bust_cache();
            built_response(&state.app, id)
        }
        Err(e) => error_response(&e),
    }
}

/// Handle POST /api/manuals/:id/process - build with customer overrides.
pub async fn process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(form): Json<ProcessForm>,
) -> Response {
    if form.customer_name.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"success": false, "error": "customer_name is required"})),
        )
            .into_response();
    }

    // A missing mode means "now": the submitted date only counts when the
    // caller explicitly chose it
    let order_value = if form.mode.as_deref().unwrap_or("now") == "now" {
        format_short_utc(&Utc::now())
    } else {
        match &form.order_date {
            Some(date) if !date.trim().is_empty() => date.trim().to_string(),
            _ => format_short_utc(&Utc::now()),
        }
    };

    let mut overrides = BTreeMap::new();
    overrides.insert(
        TOKEN_CUSTOMER_NAME.to_string(),
        form.customer_name.trim().to_string(),
    );
    overrides.insert(TOKEN_ORDER_DATE.to_string(), order_value);

    match state
        .app
        .builder
        .build(id, form.template.as_deref(), &overrides, true)
        .await
    {
        Ok(_) => {
            state.bust_cache();
            built_response(&state.app, id)
        }
        Err(e) => error_response(&e),
    }
}

/// Handle POST /api/manuals/:id/queue - enqueue a background build.
pub async fn queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(form): Json<QueueForm>,
) -> Response {
    let delay = Duration::from_secs(form.delay_secs.unwrap_or(SAVE_DELAY_SECS));
    match state.app.scheduler.enqueue(id, delay, form.force.unwrap_or(true)) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "pending": state.app.scheduler.len(),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle GET /download - serve a PDF through its signed link.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let path = match state
        .app
        .files
        .resolve_signed(&query.manual, query.exp, &query.sig)
    {
        Ok(path) => path,
        Err(e) => {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"success": false, "error": e.to_string()})),
            )
                .into_response();
        }
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&LibritoError::Io(e)),
    };

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("manual.pdf")
        .to_string();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// Item summary with a mode-appropriate PDF URL.
fn prepare_item(app: &App, entity: &Entity) -> serde_json::Value {
    let relative = entity.meta(META_PDF_RELATIVE);
    let pdf_url = if relative.is_empty() {
        serde_json::Value::Null
    } else {
        match app.settings.storage_mode {
            StorageMode::Public => json!(app.files.public_url(relative)),
            StorageMode::Protected => app
                .files
                .signed_url(relative, Duration::from_secs(DOWNLOAD_TTL_SECS))
                .map(|url| json!(url))
                .unwrap_or(serde_json::Value::Null),
        }
    };

    let generated = !entity.meta(META_PDF_HASH).is_empty();
    json!({
        "id": entity.id,
        "title": entity.title,
        "serial_code": entity.serial_code(),
        "material": entity.field("material"),
        "leather_type": entity.field("leather_type"),
        "color": entity.field("color"),
        "size": entity.field("size"),
        "status": if generated { "generated" } else { "pending" },
        "hash": entity.meta(META_PDF_HASH),
        "version": entity.meta(META_PDF_VERSION),
        "generated_at": entity.meta(META_GENERATED_AT),
        "locked": entity.is_locked(),
        "pdf_url": pdf_url,
    })
}

fn built_response(app: &App, id: u64) -> Response {
    match app.entities.get(id) {
        Ok(Some(entity)) => (
            StatusCode::OK,
            Json(json!({"success": true, "item": prepare_item(app, &entity)})),
        )
            .into_response(),
        Ok(None) => not_found(id),
        Err(e) => error_response(&e),
    }
}

fn not_found(id: u64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": format!("No manual entity {}", id)})),
    )
        .into_response()
}

/// Map the error taxonomy onto HTTP statuses.
fn error_status(e: &LibritoError) -> StatusCode {
    match e {
        LibritoError::Data(_) | LibritoError::Content(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LibritoError::Remote(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &LibritoError) -> Response {
    (
        error_status(e),
        Json(json!({"success": false, "error": e.to_string()})),
    )
        .into_response()
}

// ============================================================================
// TESTS
// ============================================================================
