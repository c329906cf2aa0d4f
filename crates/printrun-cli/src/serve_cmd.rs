use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use printrun_core::catalog::FailureReasonCatalog;
use printrun_core::ledger::{deductions_for_run, spool_balances};
use printrun_core::plate::service as plates;
use printrun_core::reconcile::ActualWeightRequest;
use printrun_core::reconcile::service as materials;
use printrun_core::run::finalize::{self, CancelRequest, FailRequest};
use printrun_core::run::service::{self as runs, ItemOutcome, NewRunRequest};
use printrun_core::run::snapshot::get_run_snapshot;
use printrun_core::{FieldError, RunError};
use printrun_db::models::RunStatus;
use printrun_db::queries::materials::NewMaterial;
use printrun_db::queries::plates::{NewPlate, PlatePatch};
use printrun_db::queries::runs::RunPatch;
use printrun_db::queries::spools::{self as spool_db, NewSpool};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub catalog: Arc<FailureReasonCatalog>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: serde_json::Value,
}

impl AppError {
    fn malformed_body(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "VALIDATION_FAILED",
            message: rejection.body_text(),
            details: serde_json::Value::Null,
        }
    }
}

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        let status = match &err {
            RunError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RunError::NotFound { .. } => StatusCode::NOT_FOUND,
            RunError::IllegalTransition { .. }
            | RunError::InsufficientStock { .. }
            | RunError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            RunError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &err {
            RunError::Validation(fields) => serde_json::json!(fields),
            RunError::IllegalTransition {
                entity,
                id,
                current,
                action,
            } => serde_json::json!({
                "entity": entity,
                "id": id,
                "current": current,
                "action": action,
            }),
            RunError::NotFound { entity, id } => serde_json::json!({ "entity": entity, "id": id }),
            RunError::InsufficientStock {
                spool_id,
                requested,
                available,
            } => serde_json::json!({
                "spool_id": spool_id,
                "requested": requested,
                "available": available,
            }),
            RunError::ConcurrentModification {
                entity,
                id,
                expected,
                actual,
            } => serde_json::json!({
                "entity": entity,
                "id": id,
                "expected": expected,
                "actual": actual,
            }),
            RunError::Storage(source) => {
                tracing::error!(error = %format!("{source:#}"), "storage failure");
                serde_json::Value::Null
            }
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            details,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Storage(err).into()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<axum::response::Response, AppError>;

/// Unwrap a JSON body, reporting malformed payloads in the API error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload.map(|Json(v)| v).map_err(AppError::malformed_body)
}

/// Like [`body`], but an absent body means `T::default()`.
fn optional_body<T: DeserializeOwned + Default>(
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    match payload {
        Ok(Json(v)) => Ok(v),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(rejection) => Err(AppError::malformed_body(rejection)),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run).patch(update_run))
        .route("/api/runs/{id}/complete", post(complete_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/fail", post(fail_run))
        .route("/api/runs/{id}/materials", post(add_material))
        .route("/api/runs/{id}/materials/reset", post(reset_materials))
        .route(
            "/api/runs/{id}/materials/{material_id}",
            patch(record_actual).delete(remove_material),
        )
        .route("/api/runs/{id}/items/{item_id}", patch(update_item))
        .route("/api/runs/{id}/plates", get(list_plates).post(create_plate))
        .route(
            "/api/runs/{id}/plates/{plate_id}",
            patch(update_plate).delete(delete_plate),
        )
        .route("/api/runs/{id}/plates/{plate_id}/start", post(start_plate))
        .route("/api/runs/{id}/plates/{plate_id}/complete", post(complete_plate))
        .route("/api/runs/{id}/plates/{plate_id}/fail", post(fail_plate))
        .route("/api/runs/{id}/plates/{plate_id}/cancel", post(cancel_plate))
        .route("/api/runs/{id}/deductions", get(list_deductions))
        .route("/api/failure-reasons", get(list_failure_reasons))
        .route("/api/spools", get(list_spools).post(create_spool))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("printrun serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("printrun serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Escape text for an HTML element body or quoted attribute.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

async fn index(State(state): State<AppState>) -> ApiResult {
    let in_progress = runs::list_runs(&state.pool, Some(RunStatus::InProgress)).await?;

    let rows = if in_progress.is_empty() {
        "<tr><td colspan=\"3\">No runs in progress.</td></tr>".to_string()
    } else {
        in_progress
            .iter()
            .map(|r| {
                format!(
                    "<tr><td><a href=\"/api/runs/{id}\">{number}</a></td><td>{started}</td><td>{printer}</td></tr>",
                    id = r.id,
                    number = escape_html(&r.run_number),
                    started = r.started_at.format("%Y-%m-%d %H:%M"),
                    printer = escape_html(r.printer_name.as_deref().unwrap_or("-")),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>printrun</title></head><body>\
<h1>printrun</h1>\
<p><a href=\"/api/runs\">/api/runs</a> | <a href=\"/api/spools\">/api/spools</a> | <a href=\"/api/failure-reasons\">/api/failure-reasons</a></p>\
<table><tr><th>Run</th><th>Started</th><th>Printer</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    status: Option<RunStatus>,
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<ListRunsQuery>) -> ApiResult {
    let list = runs::list_runs(&state.pool, query.status).await?;
    Ok(Json(list).into_response())
}

async fn create_run(
    State(state): State<AppState>,
    payload: Result<Json<NewRunRequest>, JsonRejection>,
) -> ApiResult {
    let snapshot = runs::create_run(&state.pool, body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(snapshot)).into_response())
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let snapshot = get_run_snapshot(&state.pool, id).await?;
    Ok(Json(snapshot).into_response())
}

async fn update_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<RunPatch>, JsonRejection>,
) -> ApiResult {
    let run = runs::update_run(&state.pool, id, &body(payload)?).await?;
    Ok(Json(run).into_response())
}

async fn complete_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let snapshot = finalize::complete_run(&state.pool, id).await?;
    Ok(Json(snapshot).into_response())
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult {
    let snapshot = finalize::cancel_run(&state.pool, id, &body(payload)?).await?;
    Ok(Json(snapshot).into_response())
}

async fn fail_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult {
    let snapshot = finalize::fail_run(&state.pool, &state.catalog, id, &body(payload)?).await?;
    Ok(Json(snapshot).into_response())
}

async fn update_item(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<ItemOutcome>, JsonRejection>,
) -> ApiResult {
    let item = runs::update_item_outcome(&state.pool, id, item_id, body(payload)?).await?;
    Ok(Json(item).into_response())
}

async fn list_deductions(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let journal = deductions_for_run(&state.pool, id).await?;
    Ok(Json(journal).into_response())
}

// ---------------------------------------------------------------------------
// Materials
// ---------------------------------------------------------------------------

async fn add_material(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<NewMaterial>, JsonRejection>,
) -> ApiResult {
    let line = materials::add_material(&state.pool, id, &body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(line)).into_response())
}

async fn record_actual(
    State(state): State<AppState>,
    Path((id, material_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<ActualWeightRequest>, JsonRejection>,
) -> ApiResult {
    let entry = body(payload)?.into_entry()?;
    let line = materials::record_actual(&state.pool, id, material_id, entry).await?;
    Ok(Json(line).into_response())
}

async fn remove_material(
    State(state): State<AppState>,
    Path((id, material_id)): Path<(Uuid, Uuid)>,
) -> ApiResult {
    materials::remove_material(&state.pool, id, material_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn reset_materials(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let lines = materials::reset_to_estimated(&state.pool, id).await?;
    Ok(Json(lines).into_response())
}

// ---------------------------------------------------------------------------
// Plates
// ---------------------------------------------------------------------------

async fn list_plates(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let list = plates::list_plates(&state.pool, id).await?;
    Ok(Json(list).into_response())
}

async fn create_plate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<NewPlate>, JsonRejection>,
) -> ApiResult {
    let plate = plates::create_plate(&state.pool, id, &body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(plate)).into_response())
}

async fn update_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<PlatePatch>, JsonRejection>,
) -> ApiResult {
    let plate = plates::update_plate(&state.pool, id, plate_id, &body(payload)?).await?;
    Ok(Json(plate).into_response())
}

async fn delete_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
) -> ApiResult {
    plates::delete_plate(&state.pool, id, plate_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn start_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
) -> ApiResult {
    let plate = plates::start_plate(&state.pool, id, plate_id).await?;
    Ok(Json(plate).into_response())
}

async fn complete_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<plates::CompletePlateRequest>, JsonRejection>,
) -> ApiResult {
    let plate = plates::complete_plate(&state.pool, id, plate_id, &body(payload)?).await?;
    Ok(Json(plate).into_response())
}

async fn fail_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<plates::PlateNotes>, JsonRejection>,
) -> ApiResult {
    let plate = plates::fail_plate(&state.pool, id, plate_id, &optional_body(payload)?).await?;
    Ok(Json(plate).into_response())
}

async fn cancel_plate(
    State(state): State<AppState>,
    Path((id, plate_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<plates::PlateNotes>, JsonRejection>,
) -> ApiResult {
    let plate = plates::cancel_plate(&state.pool, id, plate_id, &optional_body(payload)?).await?;
    Ok(Json(plate).into_response())
}

// ---------------------------------------------------------------------------
// Catalog and spools
// ---------------------------------------------------------------------------

async fn list_failure_reasons(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.catalog.reasons()).into_response())
}

async fn list_spools(State(state): State<AppState>) -> ApiResult {
    let balances = spool_balances(&state.pool).await?;
    Ok(Json(balances).into_response())
}

async fn create_spool(
    State(state): State<AppState>,
    payload: Result<Json<NewSpool>, JsonRejection>,
) -> ApiResult {
    let spool = body(payload)?;
    let errors = validate_spool(&spool);
    if !errors.is_empty() {
        return Err(RunError::Validation(errors).into());
    }
    let created = spool_db::insert_spool(&state.pool, &spool).await?;
    tracing::info!(spool_id = %created.id, label = %created.label, "spool registered");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

fn validate_spool(spool: &NewSpool) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if spool.label.trim().is_empty() {
        errors.push(FieldError::new("label", "must not be empty"));
    }
    if spool.material_type.trim().is_empty() {
        errors.push(FieldError::new("material_type", "must not be empty"));
    }
    if !(spool.current_weight_grams.is_finite() && spool.current_weight_grams >= 0.0) {
        errors.push(FieldError::new("current_weight_grams", "must be >= 0"));
    }
    if !(spool.cost_per_gram.is_finite() && spool.cost_per_gram >= 0.0) {
        errors.push(FieldError::new("cost_per_gram", "must be >= 0"));
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use printrun_core::catalog::FailureReasonCatalog;
    use printrun_test_utils::{create_test_db, drop_test_db, seed_spool, spool_weight};

    use super::{AppState, escape_html};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn app(pool: PgPool) -> axum::Router {
        super::build_router(AppState {
            pool,
            catalog: Arc::new(FailureReasonCatalog::builtin().unwrap()),
        })
    }

    async fn send_request(pool: PgPool, uri: &str) -> axum::response::Response {
        app(pool)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn send_json(
        pool: PgPool,
        method: &str,
        uri: &str,
        payload: Value,
    ) -> axum::response::Response {
        app(pool)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn send_empty(pool: PgPool, method: &str, uri: &str) -> axum::response::Response {
        app(pool)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Create a run through the API with one item and one material on `spool_id`.
    async fn create_run(pool: &PgPool, spool_id: uuid::Uuid, quantity: i32, grams: f64) -> Value {
        let resp = send_json(
            pool.clone(),
            "POST",
            "/api/runs",
            json!({
                "printer_name": "Bambu X1C",
                "estimated_print_time_hours": 4.0,
                "items": [{ "model_id": uuid::Uuid::new_v4(), "quantity": quantity }],
                "materials": [{ "spool_id": spool_id, "estimated_model_weight_grams": grams }],
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_returns_html() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(
            content_type.contains("text/html"),
            "content-type should contain text/html, got: {content_type}"
        );

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & Jerry's</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/a&gt;"
        );
        assert_eq!(escape_html("Prusa MK4"), "Prusa MK4");
    }

    #[tokio::test]
    async fn test_index_escapes_printer_name() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_json(
            pool.clone(),
            "POST",
            "/api/runs",
            json!({
                "printer_name": "<script>alert(1)</script>",
                "estimated_print_time_hours": 1.0,
                "items": [{ "model_id": uuid::Uuid::new_v4(), "quantity": 1 }],
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_request(pool.clone(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!html.contains("<script>"), "raw markup in index: {html}");
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_runs_empty() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/api/runs").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (pool, db_name) = create_test_db().await;
        let spool = seed_spool(&pool, "Galaxy Black PLA", 1000.0, 0.02).await;

        let created = create_run(&pool, spool.id, 5, 500.0).await;
        assert_eq!(created["status"], "in_progress");
        assert!(created["run_number"].as_str().unwrap().starts_with("RUN-"));
        assert_eq!(created["materials"][0]["spool_label"], "Galaxy Black PLA");
        assert_eq!(created["materials"][0]["estimated_total_weight"], 500.0);

        let id = created["id"].as_str().unwrap();
        let resp = send_request(pool.clone(), &format!("/api/runs/{id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["items"].as_array().unwrap().len(), 1);
        assert!(json.get("metrics").is_some(), "snapshot should carry metrics");
        assert!(json.get("plate_counts").is_some(), "snapshot should carry plate counts");

        let resp = send_request(pool.clone(), "/api/runs?status=completed").await;
        assert_eq!(body_json(resp).await, json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let (pool, db_name) = create_test_db().await;

        let random_id = uuid::Uuid::new_v4();
        let resp = send_request(pool.clone(), &format!("/api/runs/{random_id}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["details"]["entity"], "run");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_run_validation_lists_fields() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_json(pool.clone(), "POST", "/api/runs", json!({ "items": [] })).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "VALIDATION_FAILED");
        assert_eq!(json["details"][0]["field"], "items");

        let resp = send_json(
            pool.clone(),
            "POST",
            "/api/runs",
            json!({ "items": [], "surprise": true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["code"], "VALIDATION_FAILED");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_record_actual_then_complete() {
        let (pool, db_name) = create_test_db().await;
        let spool = seed_spool(&pool, "PLA", 1000.0, 0.02).await;
        let run = create_run(&pool, spool.id, 5, 500.0).await;
        let id = run["id"].as_str().unwrap();
        let material_id = run["materials"][0]["id"].as_str().unwrap();

        let resp = send_json(
            pool.clone(),
            "PATCH",
            &format!("/api/runs/{id}/materials/{material_id}"),
            json!({ "actual_model_weight_grams": 550.0 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let line = body_json(resp).await;
        let variance = line["reconciliation"]["variance_percentage"].as_f64().unwrap();
        assert!((variance - 10.0).abs() < 1e-9);

        let resp = send_json(
            pool.clone(),
            "PATCH",
            &format!("/api/runs/{id}/items/{}", run["items"][0]["id"].as_str().unwrap()),
            json!({ "successful_quantity": 5, "failed_quantity": 0 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_empty(pool.clone(), "POST", &format!("/api/runs/{id}/complete")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["metrics"]["overall_success_rate"], 100.0);
        assert_eq!(spool_weight(&pool, spool.id).await, 450.0);

        let resp = send_empty(pool.clone(), "POST", &format!("/api/runs/{id}/complete")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "ILLEGAL_TRANSITION");
        assert_eq!(json["details"]["current"], "completed");
        assert_eq!(spool_weight(&pool, spool.id).await, 450.0);

        let resp = send_request(pool.clone(), &format!("/api/runs/{id}/deductions")).await;
        let journal = body_json(resp).await;
        assert_eq!(journal.as_array().unwrap().len(), 1);
        assert_eq!(journal[0]["grams"], 550.0);

        let resp = send_request(pool.clone(), "/api/spools").await;
        let spools = body_json(resp).await;
        assert_eq!(spools[0]["current_weight_grams"], 450.0);
        assert_eq!(spools[0]["deducted_grams"], 550.0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_record_actual_rejects_mixed_forms() {
        let (pool, db_name) = create_test_db().await;
        let spool = seed_spool(&pool, "PLA", 1000.0, 0.02).await;
        let run = create_run(&pool, spool.id, 1, 100.0).await;
        let id = run["id"].as_str().unwrap();
        let material_id = run["materials"][0]["id"].as_str().unwrap();

        let resp = send_json(
            pool.clone(),
            "PATCH",
            &format!("/api/runs/{id}/materials/{material_id}"),
            json!({
                "actual_model_weight_grams": 90.0,
                "spool_weight_before_grams": 1000.0,
                "spool_weight_after_grams": 900.0,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_fail_run_with_waste() {
        let (pool, db_name) = create_test_db().await;
        let a = seed_spool(&pool, "A", 1000.0, 0.02).await;
        let b = seed_spool(&pool, "B", 1000.0, 0.03).await;
        let run = create_run(&pool, a.id, 2, 100.0).await;
        let id = run["id"].as_str().unwrap();

        let resp = send_json(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/fail"),
            json!({ "failure_reason": "not_a_reason", "waste_materials": [] }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = send_json(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/fail"),
            json!({
                "failure_reason": "spaghetti",
                "waste_materials": [
                    { "spool_id": a.id, "grams": 50.0 },
                    { "spool_id": b.id, "grams": 20.0 },
                ],
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["waste_filament_grams"], 70.0);
        assert_eq!(spool_weight(&pool, a.id).await, 950.0);
        assert_eq!(spool_weight(&pool, b.id).await, 980.0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_cancel_insufficient_stock_is_conflict() {
        let (pool, db_name) = create_test_db().await;
        let spool = seed_spool(&pool, "Nearly empty", 30.0, 0.02).await;
        let run = create_run(&pool, spool.id, 1, 25.0).await;
        let id = run["id"].as_str().unwrap();

        let resp = send_json(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/cancel"),
            json!({
                "cancel_mode": "record_partial",
                "partial_usage": [{ "spool_id": spool.id, "grams": 45.0 }],
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "INSUFFICIENT_STOCK");
        assert_eq!(json["details"]["available"], 30.0);
        assert_eq!(spool_weight(&pool, spool.id).await, 30.0);

        let resp = send_request(pool.clone(), &format!("/api/runs/{id}")).await;
        assert_eq!(body_json(resp).await["status"], "in_progress");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_plate_routes() {
        let (pool, db_name) = create_test_db().await;
        let spool = seed_spool(&pool, "PLA", 1000.0, 0.02).await;
        let run = create_run(&pool, spool.id, 8, 200.0).await;
        let id = run["id"].as_str().unwrap();
        let model_id = run["items"][0]["model_id"].clone();

        let resp = send_json(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/plates"),
            json!({ "model_id": model_id, "prints_per_plate": 4 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let plate = body_json(resp).await;
        assert_eq!(plate["plate_name"], "Plate 1");
        let plate_id = plate["id"].as_str().unwrap();

        let resp = send_empty(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/plates/{plate_id}/start"),
        )
        .await;
        assert_eq!(body_json(resp).await["status"], "printing");

        let resp = send_json(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/plates/{plate_id}/complete"),
            json!({ "successful_prints": 4 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_empty(
            pool.clone(),
            "POST",
            &format!("/api/runs/{id}/plates/{plate_id}/fail"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send_empty(
            pool.clone(),
            "DELETE",
            &format!("/api/runs/{id}/plates/{plate_id}"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send_request(pool.clone(), &format!("/api/runs/{id}")).await;
        let json = body_json(resp).await;
        assert_eq!(json["items"][0]["successful_quantity"], 4);
        assert_eq!(json["plate_counts"]["completed"], 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_failure_reasons_and_spools() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "/api/failure-reasons").await;
        let reasons = body_json(resp).await;
        assert!(
            reasons
                .as_array()
                .unwrap()
                .iter()
                .any(|r| r["value"] == "layer_shift")
        );

        let resp = send_json(
            pool.clone(),
            "POST",
            "/api/spools",
            json!({
                "label": "Silk Gold",
                "material_type": "PLA",
                "current_weight_grams": 750.0,
                "cost_per_gram": 0.028,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_json(
            pool.clone(),
            "POST",
            "/api/spools",
            json!({
                "label": " ",
                "material_type": "PLA",
                "current_weight_grams": -1.0,
                "cost_per_gram": 0.02,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["details"].as_array().unwrap().len(), 2);

        let resp = send_request(pool.clone(), "/api/spools").await;
        let spools = body_json(resp).await;
        assert_eq!(spools.as_array().unwrap().len(), 1);
        assert_eq!(spools[0]["label"], "Silk Gold");
        assert_eq!(spools[0]["deducted_grams"], 0.0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
