//! Referral Ledger API Server — registration, payment webhooks and referral stats.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use ledger_core::{AppError, Settings, telemetry};
use ledger_referral::{
    CommissionCalculator, LedgerAggregator, PaymentEvent, PgStore, ReferralLinker, ReferralStore,
    Registration, policy,
};
use ledger_storage::{self as storage, models::AccountKind};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Shared application state.
struct AppState {
    linker: ReferralLinker,
    calculator: CommissionCalculator,
    aggregator: LedgerAggregator,
    webhook_secret: Option<String>,
}

impl AppState {
    fn new(store: Arc<dyn ReferralStore>, settings: &Settings) -> Self {
        Self {
            linker: ReferralLinker::with_retry_budget(store.clone(), settings.code_retry_budget),
            calculator: CommissionCalculator::new(
                store.clone(),
                policy::from_settings(&settings.commission),
            ),
            aggregator: LedgerAggregator::new(store),
            webhook_secret: settings.webhook_secret.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let settings = Settings::from_env().expect("Failed to load settings");

    tracing::info!(
        mode = ?settings.commission.mode,
        direct = %settings.commission.direct,
        second_tier = %settings.commission.second_tier,
        "Starting Referral Ledger API Server"
    );

    // Connect to database
    let pool = storage::connect(&settings.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Database ready");

    let state = Arc::new(AppState::new(Arc::new(PgStore::new(pool)), &settings));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind API port");
    axum::serve(listener, app).await.expect("API server failed");
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/accounts", post(register_account))
        .route("/api/v1/accounts/:id/stats", get(get_stats_by_id))
        .route("/api/v1/accounts/:id/commissions", get(list_commissions))
        .route("/api/v1/accounts/:id/payouts", post(mark_paid))
        .route("/api/v1/referrals/:code/stats", get(get_stats_by_code))
        .route("/api/v1/webhooks/payments", post(payment_webhook))
        .route("/health", get(health))
        .with_state(state)
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    /// Supplied by the auth provider; generated when absent.
    account_id: Option<Uuid>,
    first_name: String,
    last_name: String,
    kind: AccountKind,
    referral_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayoutRequest {
    transaction_ids: Vec<Uuid>,
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct WebhookReceipt {
    payment_id: Uuid,
    status: &'static str,
    commissions_created: usize,
}

#[derive(Serialize)]
struct PayoutReceipt {
    marked: u64,
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn json_ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn json_err(status: StatusCode, msg: &str) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: msg.to_string(),
        }),
    )
}

/// Database failures surface as 5xx so the payment processor redelivers.
fn app_err(e: AppError) -> ApiError {
    let status = match &e {
        AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
        AppError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        AppError::CodeGenerationExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Database(_) | AppError::Config(_) | AppError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    }
    json_err(status, &e.to_string())
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// POST /api/v1/accounts — create an account and link its referral code.
async fn register_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.first_name.trim().is_empty() || req.last_name.trim().is_empty() {
        return Err(json_err(
            StatusCode::UNPROCESSABLE_ENTITY,
            "first_name and last_name are required",
        ));
    }

    let registration = Registration {
        account_id: req.account_id.unwrap_or_else(Uuid::new_v4),
        first_name: req.first_name,
        last_name: req.last_name,
        kind: req.kind,
        referral_code: req.referral_code,
    };
    let account = state.linker.register(&registration).await.map_err(app_err)?;
    Ok((StatusCode::CREATED, json_ok(account)))
}

/// POST /api/v1/webhooks/payments — payment status change from the processor.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<PaymentEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let supplied = headers
            .get("x-webhook-secret")
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !bool::from(supplied.ct_eq(secret.as_bytes())) {
            tracing::warn!(payment_id = %event.payment_id, "Rejected webhook with bad secret");
            return Err(json_err(StatusCode::UNAUTHORIZED, "invalid webhook secret"));
        }
    }

    let outcome = state
        .calculator
        .record_payment_event(event)
        .await
        .map_err(app_err)?;

    Ok(json_ok(WebhookReceipt {
        payment_id: outcome.payment.id,
        status: outcome.payment.status.as_str(),
        commissions_created: outcome.commissions.len(),
    }))
}

/// GET /api/v1/referrals/:code/stats — dashboard figures for a referral code.
async fn get_stats_by_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .aggregator
        .get_referral_stats(&code)
        .await
        .map_err(app_err)?;
    Ok(json_ok(stats))
}

/// GET /api/v1/accounts/:id/stats — dashboard figures for an account.
async fn get_stats_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .aggregator
        .get_referral_stats_by_id(id)
        .await
        .map_err(app_err)?;
    Ok(json_ok(stats))
}

/// GET /api/v1/accounts/:id/commissions — ledger rows owed to an account.
async fn list_commissions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.aggregator.commissions(id).await.map_err(app_err)?;
    Ok(json_ok(rows))
}

/// POST /api/v1/accounts/:id/payouts — mark commissions as paid out.
async fn mark_paid(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PayoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let marked = state
        .calculator
        .mark_paid(id, &req.transaction_ids)
        .await
        .map_err(app_err)?;
    Ok(json_ok(PayoutReceipt { marked }))
}
