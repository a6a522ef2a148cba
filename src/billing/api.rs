use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{self, Tariff};
use crate::error::{AppError, AppResult};

use super::accounts::BalanceOverview;
use super::engine::{GenerationGate, Reservation};
use super::ledger;
use super::models::{LedgerTransaction, Subscription};
use super::payments::{PaymentIntentRecord, WebhookOutcome};
use super::referrals::ReferralStats;
use super::{BillingContext, Onboarding};

const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// key: billing-api -> rest endpoints
pub async fn handle_webhook(
    Extension(ctx): Extension<BillingContext>,
    Path(provider): Path<String>,
    Json(payload): Json<Value>,
) -> AppResult<Json<WebhookOutcome>> {
    let outcome = ctx.payments.process_event(&provider, &payload).await?;
    Ok(Json(outcome))
}

/// First contact: creates the account, grants the registration bonus and
/// resolves an optional referral start parameter. Retries finish whatever an
/// earlier attempt left undone.
pub async fn register_account(
    Extension(ctx): Extension<BillingContext>,
    Json(payload): Json<RegisterAccountRequest>,
) -> AppResult<(StatusCode, Json<Onboarding>)> {
    let external_id = payload.external_id.trim();
    if external_id.is_empty() {
        return Err(AppError::BadRequest("external_id must not be empty".into()));
    }

    let onboarding = ctx
        .onboard(external_id, payload.reference.as_deref())
        .await?;
    let status = if onboarding.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(onboarding)))
}

pub async fn create_payment(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
    Json(payload): Json<CreatePaymentRequest>,
) -> AppResult<(StatusCode, Json<PaymentIntentRecord>)> {
    let return_url = payload
        .return_url
        .or_else(|| Some(format!("{}/return", config::PAYMENT_RETURN_BASE_URL.as_str())));
    let intent = ctx
        .payments
        .create_intent(account_id, &payload.tariff, &payload.provider, return_url)
        .await?;
    Ok((StatusCode::CREATED, Json(intent)))
}

pub async fn get_balance(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
) -> AppResult<Json<BalanceOverview>> {
    Ok(Json(ctx.accounts.balance_overview(account_id).await?))
}

pub async fn list_transactions(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<TransactionPage>> {
    ctx.accounts.get(account_id).await?;
    let (limit, offset) = ledger::page_bounds(
        params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        params.offset.unwrap_or(0),
    );
    let transactions = ctx.ledger.history(account_id, limit, offset).await?;
    let total = ctx.ledger.count_total(account_id).await?;
    Ok(Json(TransactionPage {
        transactions,
        total,
        limit,
        offset,
    }))
}

pub async fn cancel_subscription(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
    payload: Option<Json<CancelSubscriptionRequest>>,
) -> AppResult<Json<Subscription>> {
    let current = ctx
        .subscriptions
        .active_subscription(account_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let reason = payload
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "requested by user".to_string());
    let subscription = ctx.subscriptions.cancel(current.id, &reason).await?;
    Ok(Json(subscription))
}

pub async fn referral_stats(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
) -> AppResult<Json<ReferralStats>> {
    ctx.accounts.get(account_id).await?;
    Ok(Json(ctx.referrals.stats(account_id).await?))
}

pub async fn quote_generation(
    Extension(ctx): Extension<BillingContext>,
    Path(account_id): Path<i64>,
    Json(payload): Json<QuoteRequest>,
) -> AppResult<Json<QuoteResponse>> {
    let quantity = payload.quantity.unwrap_or(Decimal::ONE);
    if quantity <= Decimal::ZERO {
        return Err(AppError::BadRequest("quantity must be positive".into()));
    }
    let reservation = ctx
        .engine
        .check_and_reserve(account_id, &payload.model, quantity)
        .await?;
    let generation_type = match &reservation {
        Reservation::Allowed(cost) | Reservation::Denied { cost, .. } => {
            cost.generation_type.clone()
        }
    };
    let gate = ctx
        .engine
        .gate(account_id, &generation_type, Utc::now())
        .await?;
    Ok(Json(QuoteResponse { reservation, gate }))
}

pub async fn list_tariffs(Extension(ctx): Extension<BillingContext>) -> Json<Vec<Tariff>> {
    Json(ctx.catalog.enabled_tariffs().cloned().collect())
}

#[derive(Debug, Deserialize)]
pub struct RegisterAccountRequest {
    pub external_id: String,
    /// Start parameter such as `ref_12345`.
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub tariff: String,
    pub provider: String,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<LedgerTransaction>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub model: String,
    #[serde(default)]
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    pub reservation: Reservation,
    pub gate: GenerationGate,
}
