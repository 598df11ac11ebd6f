use std::net::SocketAddr;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use renova_platform::{
    ObligationStatusResponse, PauseObligationRequest, ServiceConfig, connect_database,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

#[derive(Debug, Clone, Deserialize)]
struct ListRunsQuery {
    job: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunView {
    id: Uuid,
    job_name: String,
    run_date: NaiveDate,
    status: String,
    results: serde_json::Value,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct DueObligationsQuery {
    company: Option<Uuid>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DueObligationView {
    id: Uuid,
    tenant_id: Uuid,
    client_id: Uuid,
    amount: Decimal,
    currency: String,
    frequency: String,
    next_due_at: DateTime<Utc>,
    last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailedInvoicesQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FailedInvoiceView {
    id: Uuid,
    obligation_id: Uuid,
    amount: Decimal,
    currency: String,
    status: String,
    payment_attempts: i32,
    last_payment_attempt_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "renova_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url).await?;

    let state = AppState { pool };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/runs", get(list_runs))
        .route("/obligations/due", get(list_due_obligations))
        .route("/obligations/{obligation_id}/pause", post(pause_obligation))
        .route("/obligations/{obligation_id}/resume", post(resume_obligation))
        .route("/invoices/failed", get(list_failed_invoices))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

fn db_error(err: sqlx::Error) -> (StatusCode, String) {
    error!("query failed: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunView>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let rows = sqlx::query(
        r#"
        SELECT id, job_name, run_date, status, results, started_at, finished_at
        FROM run_ledger
        WHERE ($1::text IS NULL OR job_name = $1)
        ORDER BY started_at DESC
        LIMIT $2
        "#,
    )
    .bind(query.job)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(db_error)?;

    let runs = rows
        .into_iter()
        .map(|row| {
            Ok(RunView {
                id: row.try_get("id")?,
                job_name: row.try_get("job_name")?,
                run_date: row.try_get("run_date")?,
                status: row.try_get("status")?,
                results: row.try_get("results")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(db_error)?;

    Ok(Json(runs))
}

async fn list_due_obligations(
    State(state): State<AppState>,
    Query(query): Query<DueObligationsQuery>,
) -> Result<Json<Vec<DueObligationView>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows = sqlx::query(
        r#"
        SELECT id, tenant_id, client_id, amount, currency, frequency, next_due_at, last_processed_at
        FROM obligations
        WHERE status = 'ACTIVE'
          AND auto_renew
          AND next_due_at <= $1
          AND ($2::uuid IS NULL OR tenant_id = $2)
        ORDER BY next_due_at ASC, id ASC
        LIMIT $3
        "#,
    )
    .bind(Utc::now())
    .bind(query.company)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(db_error)?;

    let obligations = rows
        .into_iter()
        .map(|row| {
            Ok(DueObligationView {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                client_id: row.try_get("client_id")?,
                amount: row.try_get("amount")?,
                currency: row.try_get("currency")?,
                frequency: row.try_get("frequency")?,
                next_due_at: row.try_get("next_due_at")?,
                last_processed_at: row.try_get("last_processed_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(db_error)?;

    Ok(Json(obligations))
}

async fn list_failed_invoices(
    State(state): State<AppState>,
    Query(query): Query<FailedInvoicesQuery>,
) -> Result<Json<Vec<FailedInvoiceView>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows = sqlx::query(
        r#"
        SELECT id, obligation_id, amount, currency, status, payment_attempts,
               last_payment_attempt_at, failure_reason
        FROM invoices
        WHERE status IN ('FAILED', 'OVERDUE')
        ORDER BY last_payment_attempt_at DESC NULLS LAST, id ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(db_error)?;

    let invoices = rows
        .into_iter()
        .map(|row| {
            Ok(FailedInvoiceView {
                id: row.try_get("id")?,
                obligation_id: row.try_get("obligation_id")?,
                amount: row.try_get("amount")?,
                currency: row.try_get("currency")?,
                status: row.try_get("status")?,
                payment_attempts: row.try_get("payment_attempts")?,
                last_payment_attempt_at: row.try_get("last_payment_attempt_at")?,
                failure_reason: row.try_get("failure_reason")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(db_error)?;

    Ok(Json(invoices))
}

async fn pause_obligation(
    State(state): State<AppState>,
    Path(obligation_id): Path<Uuid>,
    Json(payload): Json<PauseObligationRequest>,
) -> Result<Json<ObligationStatusResponse>, (StatusCode, String)> {
    let reason = payload
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("paused by operator")
        .to_string();

    let row = sqlx::query(
        r#"
        UPDATE obligations
        SET status = 'PAUSED', pause_reason = $2, updated_at = $3
        WHERE id = $1 AND status = 'ACTIVE'
        RETURNING id, status, pause_reason, next_due_at, updated_at
        "#,
    )
    .bind(obligation_id)
    .bind(&reason)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(db_error)?;

    let Some(row) = row else {
        return Err((
            StatusCode::NOT_FOUND,
            "obligation not found or not active".to_string(),
        ));
    };

    obligation_status_response(row).map(Json).map_err(db_error)
}

async fn resume_obligation(
    State(state): State<AppState>,
    Path(obligation_id): Path<Uuid>,
) -> Result<Json<ObligationStatusResponse>, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        UPDATE obligations
        SET status = 'ACTIVE', pause_reason = NULL, updated_at = $2
        WHERE id = $1 AND status = 'PAUSED'
        RETURNING id, status, pause_reason, next_due_at, updated_at
        "#,
    )
    .bind(obligation_id)
    .bind(Utc::now())
    .fetch_optional(&state.pool)
    .await
    .map_err(db_error)?;

    let Some(row) = row else {
        return Err((
            StatusCode::NOT_FOUND,
            "obligation not found or not paused".to_string(),
        ));
    };

    obligation_status_response(row).map(Json).map_err(db_error)
}

fn obligation_status_response(
    row: sqlx::postgres::PgRow,
) -> Result<ObligationStatusResponse, sqlx::Error> {
    Ok(ObligationStatusResponse {
        obligation_id: row.try_get("id")?,
        status: row.try_get("status")?,
        pause_reason: row.try_get("pause_reason")?,
        next_due_at: row.try_get("next_due_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
