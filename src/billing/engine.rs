use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BillingCatalog;

use super::error::{BillingError, BillingResult};
use super::generation::{GenerationLog, GenerationOutput, GenerationProvider};
use super::ledger::{self, LedgerEntry};
use super::models::{Account, GenerationRecord, LedgerTransaction, TransactionKind};
use super::pricing::{token_cost, Usage};
use super::subscriptions::{self, allocate};

/// Priced request, produced by `check_and_reserve`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationCost {
    pub can_proceed: bool,
    pub model_key: String,
    pub generation_type: String,
    pub quantity: Decimal,
    pub tokens_cost: i64,
    pub cost_estimate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub required: i64,
    pub available: i64,
    pub balance: i64,
    pub subscription_tokens: i64,
    pub shortfall: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Reservation {
    Allowed(GenerationCost),
    Denied { cost: GenerationCost, denial: Denial },
}

impl Reservation {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Reservation::Allowed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GenerationGate {
    Open,
    Cooldown { retry_after_secs: u64 },
    TooManyPending { pending: i64, limit: u32 },
}

/// Affordability decision against both pools. Nothing is held.
pub fn evaluate_affordability(tokens_cost: i64, balance: i64, subscription_tokens: i64) -> Option<Denial> {
    let available = balance + subscription_tokens;
    if available >= tokens_cost {
        return None;
    }
    Some(Denial {
        required: tokens_cost,
        available,
        balance,
        subscription_tokens,
        shortfall: tokens_cost - available,
    })
}

/// Parallelism first, then the per-type cooldown.
pub fn evaluate_gate(
    last_started_at: Option<DateTime<Utc>>,
    pending: i64,
    cooldown_secs: u64,
    max_parallel: u32,
    now: DateTime<Utc>,
) -> GenerationGate {
    if max_parallel > 0 && pending >= i64::from(max_parallel) {
        return GenerationGate::TooManyPending {
            pending,
            limit: max_parallel,
        };
    }
    if let Some(last) = last_started_at {
        let elapsed_ms = (now - last).num_milliseconds().max(0) as u64;
        let cooldown_ms = cooldown_secs.saturating_mul(1000);
        if elapsed_ms < cooldown_ms {
            let remaining_ms = cooldown_ms - elapsed_ms;
            return GenerationGate::Cooldown {
                retry_after_secs: (remaining_ms + 999) / 1000,
            };
        }
    }
    GenerationGate::Open
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub account_id: i64,
    pub model_key: String,
    pub generation_type: String,
    pub tokens_cost: i64,
    pub record_id: Option<Uuid>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeResult {
    pub tokens_charged: i64,
    pub from_subscription: i64,
    pub from_balance: i64,
    pub transaction: Option<LedgerTransaction>,
    pub balance_after: i64,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub account_id: i64,
    pub model_key: String,
    pub quantity: Decimal,
    pub prompt: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationRun {
    Throttled { gate: GenerationGate },
    Denied { denial: Denial },
    Completed {
        record_id: Uuid,
        output: GenerationOutput,
        charge: ChargeResult,
    },
}

/// key: billing-engine -> reserve before the external call, charge after delivery
#[derive(Clone)]
pub struct BillingEngine {
    pool: PgPool,
    catalog: Arc<BillingCatalog>,
    log: GenerationLog,
}

impl BillingEngine {
    pub fn new(pool: PgPool, catalog: Arc<BillingCatalog>) -> Self {
        let log = GenerationLog::new(pool.clone());
        Self { pool, catalog, log }
    }

    pub fn log(&self) -> &GenerationLog {
        &self.log
    }

    /// Prices the request and compares it against subscription pool plus wallet.
    /// A denial leaves no trace; an approval holds nothing either.
    pub async fn check_and_reserve(
        &self,
        account_id: i64,
        model_key: &str,
        quantity: Decimal,
    ) -> BillingResult<Reservation> {
        let model = self
            .catalog
            .model(model_key)
            .ok_or_else(|| BillingError::UnknownModel(model_key.to_string()))?;

        let tokens_cost = if self.catalog.billing.enabled {
            token_cost(model.price_tokens, quantity)
        } else {
            0
        };
        let mut cost = GenerationCost {
            can_proceed: true,
            model_key: model_key.to_string(),
            generation_type: model.generation_type.clone(),
            quantity,
            tokens_cost,
            cost_estimate: model.cost.calculate(None),
        };

        let account = self.account(account_id).await?;
        if tokens_cost == 0 {
            return Ok(Reservation::Allowed(cost));
        }

        let subscription_tokens = self.subscription_tokens(account_id, Utc::now()).await?;
        match evaluate_affordability(tokens_cost, account.balance, subscription_tokens) {
            None => Ok(Reservation::Allowed(cost)),
            Some(denial) => {
                info!(
                    account_id,
                    model = model_key,
                    required = denial.required,
                    shortfall = denial.shortfall,
                    "generation denied for insufficient balance"
                );
                cost.can_proceed = false;
                Ok(Reservation::Denied { cost, denial })
            }
        }
    }

    /// Advisory throttling, independent of affordability.
    pub async fn gate(
        &self,
        account_id: i64,
        generation_type: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<GenerationGate> {
        let limits = &self.catalog.limits;
        let pending = self.log.pending_count(account_id).await?;
        let last = self.log.last_started_at(account_id, generation_type).await?;
        Ok(evaluate_gate(
            last,
            pending,
            limits.cooldown_secs(generation_type),
            limits.max_parallel_tasks_per_account,
            now,
        ))
    }

    pub async fn start_generation(
        &self,
        account_id: i64,
        cost: &GenerationCost,
    ) -> BillingResult<GenerationRecord> {
        self.log
            .start(
                account_id,
                &cost.generation_type,
                &cost.model_key,
                cost.cost_estimate,
            )
            .await
    }

    pub async fn fail_generation(&self, record_id: Uuid, error: &str) -> BillingResult<()> {
        self.log.fail(record_id, error).await
    }

    /// Commits a charge after the result reached the requester.
    ///
    /// Spends the subscription pool first and writes one `generation_charge`
    /// entry for the wallet share only. Balance is re-checked under the account
    /// lock; if a concurrent charge already spent it the whole charge rolls back
    /// with `InsufficientBalance` rather than overdrawing.
    pub async fn charge_generation(&self, request: ChargeRequest) -> BillingResult<ChargeResult> {
        let now = Utc::now();
        let cost = request.tokens_cost.max(0);
        let cost_actual = self
            .catalog
            .model(&request.model_key)
            .map(|model| model.cost.calculate(request.usage.as_ref()));

        let mut tx = self.pool.begin().await?;
        let account = ledger::lock_account(&mut tx, request.account_id).await?;

        let pool = if cost > 0 {
            subscriptions::usable_pool_for_update(&mut tx, request.account_id, now).await?
        } else {
            None
        };
        let pool_tokens = pool.as_ref().map_or(0, |sub| sub.tokens_remaining);
        let allocation = allocate(cost, pool_tokens);

        if allocation.from_balance > account.balance {
            warn!(
                account_id = request.account_id,
                required = cost,
                balance = account.balance,
                subscription_tokens = pool_tokens,
                "charge rejected on re-validation"
            );
            return Err(BillingError::InsufficientBalance {
                required: cost,
                available: account.balance.max(0) + pool_tokens,
            });
        }

        if let Some(sub) = &pool {
            subscriptions::consume_pool_in(&mut tx, sub.id, allocation.from_subscription).await?;
        }

        let transaction = if allocation.from_balance > 0 {
            let entry = LedgerEntry::new(
                request.account_id,
                TransactionKind::GenerationCharge,
                -allocation.from_balance,
            )
            .describe(format!("Generation with {}", request.model_key))
            .with_metadata(json!({
                "model_key": request.model_key,
                "generation_type": request.generation_type,
                "from_subscription": allocation.from_subscription,
                "generation_record_id": request.record_id,
            }));
            Some(ledger::record_in(&mut tx, entry).await?)
        } else {
            None
        };

        if let Some(record_id) = request.record_id {
            self.log
                .complete_in(
                    &mut tx,
                    record_id,
                    cost,
                    transaction.as_ref().map(|entry| entry.id),
                    cost_actual,
                )
                .await?;
        }

        tx.commit().await?;

        let balance_after = transaction
            .as_ref()
            .map_or(account.balance, |entry| entry.balance_after);
        info!(
            account_id = request.account_id,
            model = %request.model_key,
            tokens = cost,
            from_subscription = allocation.from_subscription,
            from_balance = allocation.from_balance,
            balance_after,
            "generation charged"
        );

        Ok(ChargeResult {
            tokens_charged: cost,
            from_subscription: allocation.from_subscription,
            from_balance: allocation.from_balance,
            transaction,
            balance_after,
        })
    }

    /// Gate, reserve, record, generate, deliver, charge. Any failure before the
    /// charge marks the record failed and bills nothing.
    pub async fn run_generation<D, Fut>(
        &self,
        request: GenerationRequest,
        provider: &dyn GenerationProvider,
        deliver: D,
    ) -> BillingResult<GenerationRun>
    where
        D: FnOnce(GenerationOutput) -> Fut,
        Fut: Future<Output = anyhow::Result<GenerationOutput>>,
    {
        let model = self
            .catalog
            .model(&request.model_key)
            .ok_or_else(|| BillingError::UnknownModel(request.model_key.clone()))?;

        let gate = self
            .gate(request.account_id, &model.generation_type, Utc::now())
            .await?;
        if gate != GenerationGate::Open {
            return Ok(GenerationRun::Throttled { gate });
        }

        let cost = match self
            .check_and_reserve(request.account_id, &request.model_key, request.quantity)
            .await?
        {
            Reservation::Allowed(cost) => cost,
            Reservation::Denied { denial, .. } => return Ok(GenerationRun::Denied { denial }),
        };

        let record = self.start_generation(request.account_id, &cost).await?;

        let output = match provider
            .generate(&model.model_id, &request.prompt, &request.params)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(?err, record = %record.id, provider = provider.name(), "generation failed");
                self.log.fail(record.id, &err.to_string()).await?;
                return Err(BillingError::GenerationFailed(err.to_string()));
            }
        };

        let usage = output.usage;
        let output = match deliver(output).await {
            Ok(output) => output,
            Err(err) => {
                warn!(?err, record = %record.id, "result delivery failed");
                self.log.fail(record.id, &format!("delivery: {err}")).await?;
                return Err(BillingError::DeliveryFailed(err.to_string()));
            }
        };

        let charge = self
            .charge_generation(ChargeRequest {
                account_id: request.account_id,
                model_key: cost.model_key.clone(),
                generation_type: cost.generation_type.clone(),
                tokens_cost: cost.tokens_cost,
                record_id: Some(record.id),
                usage,
            })
            .await;

        match charge {
            Ok(charge) => Ok(GenerationRun::Completed {
                record_id: record.id,
                output,
                charge,
            }),
            Err(err) => {
                if let Err(log_err) = self.log.fail(record.id, &err.to_string()).await {
                    warn!(?log_err, record = %record.id, "failed to mark generation record");
                }
                Err(err)
            }
        }
    }

    async fn account(&self, account_id: i64) -> BillingResult<Account> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    async fn subscription_tokens(&self, account_id: i64, now: DateTime<Utc>) -> BillingResult<i64> {
        let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT tokens_remaining, period_end FROM subscriptions
            WHERE account_id = $1 AND status <> 'expired'
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .filter(|(_, period_end)| now < *period_end)
            .map_or(0, |(tokens, _)| tokens))
    }
}
