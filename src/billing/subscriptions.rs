use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{BillingCatalog, Tariff};

use super::error::{BillingError, BillingResult};
use super::ledger::{self, LedgerEntry};
use super::models::{
    LedgerTransaction, Subscription, SubscriptionRow, SubscriptionStatus, TransactionKind,
};

/// Split of a charge between the subscription pool and the wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub from_subscription: i64,
    pub from_balance: i64,
}

/// Subscription pool first, wallet for the remainder.
pub fn allocate(amount: i64, pool_remaining: i64) -> Allocation {
    let amount = amount.max(0);
    let from_subscription = amount.min(pool_remaining.max(0));
    Allocation {
        from_subscription,
        from_balance: amount - from_subscription,
    }
}

/// Tokens moved to the wallet when a pool is closed. An unknown tariff
/// (`None`) transfers: tokens are only destroyed when a tariff says so.
pub fn leftover_transfer(tokens_remaining: i64, burn_unused: Option<bool>) -> i64 {
    match burn_unused {
        Some(true) => 0,
        _ => tokens_remaining.max(0),
    }
}

/// Same tariff on a live, non-canceled subscription extends it instead of starting over.
pub fn renews_in_place(current: &Subscription, tariff_slug: &str) -> bool {
    current.tariff_slug == tariff_slug
        && matches!(
            current.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalTerms {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub tokens_per_period: i64,
    pub tokens_remaining: i64,
    pub transferred: i64,
    pub burned: i64,
}

/// The next period starts where the current one ends, or now if it already lapsed.
/// Leftover pool tokens follow the tariff's burn policy, exactly as on expiry.
pub fn renewal_terms(current: &Subscription, tariff: &Tariff, now: DateTime<Utc>) -> RenewalTerms {
    let period_start = current.period_end.max(now);
    let leftover = current.tokens_remaining.max(0);
    let transferred = leftover_transfer(leftover, Some(tariff.burn_unused));
    RenewalTerms {
        period_start,
        period_end: period_start + Duration::days(tariff.period_days),
        tokens_per_period: tariff.tokens_per_period,
        tokens_remaining: tariff.tokens_per_period,
        transferred,
        burned: leftover - transferred,
    }
}

#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub account_id: i64,
    pub tariff_slug: String,
    pub provider: String,
    pub payment_method_ref: Option<String>,
    pub auto_renewal: bool,
    pub payment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationKind {
    Created,
    Renewed,
    Replaced { previous_subscription_id: Uuid },
}

#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub subscription: Subscription,
    pub kind: ActivationKind,
    pub transfers: Vec<LedgerTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Renewal {
    pub subscription: Subscription,
    pub transferred: i64,
    pub transfer: Option<LedgerTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Expiry {
    pub subscription: Subscription,
    pub transfer: Option<LedgerTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub subscription: Subscription,
    pub tariff_name: Option<String>,
    pub usable_tokens: i64,
    pub days_left: i64,
}

/// key: subscription-manager -> activation, renewal, cancellation, expiry
#[derive(Clone)]
pub struct SubscriptionManager {
    pool: PgPool,
    catalog: Arc<BillingCatalog>,
}

impl SubscriptionManager {
    pub fn new(pool: PgPool, catalog: Arc<BillingCatalog>) -> Self {
        Self { pool, catalog }
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::from)
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }

    /// The account's non-expired subscription, if any.
    pub async fn active_subscription(&self, account_id: i64) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE account_id = $1 AND status <> 'expired'",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    /// Display view of the live subscription.
    pub async fn subscription_info(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<SubscriptionInfo>> {
        let Some(subscription) = self.active_subscription(account_id).await? else {
            return Ok(None);
        };
        let tariff_name = self
            .catalog
            .tariff(&subscription.tariff_slug)
            .map(|tariff| tariff.name.clone());
        let days_left = (subscription.period_end - now).num_days().max(0);
        Ok(Some(SubscriptionInfo {
            usable_tokens: subscription.usable_tokens(now),
            tariff_name,
            days_left,
            subscription,
        }))
    }

    pub async fn activate(&self, request: ActivationRequest) -> BillingResult<Activation> {
        let mut tx = self.pool.begin().await?;
        let activation = self.activate_in(&mut tx, &request, Utc::now()).await?;
        tx.commit().await?;
        Ok(activation)
    }

    /// Keeps at most one live subscription per account: the same tariff renews in
    /// place, anything else closes the current subscription before opening the new one.
    pub(crate) async fn activate_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &ActivationRequest,
        now: DateTime<Utc>,
    ) -> BillingResult<Activation> {
        let tariff = self.subscription_tariff(&request.tariff_slug)?;
        ledger::lock_account(tx, request.account_id).await?;
        let existing = live_for_update(tx, request.account_id).await?;

        match existing {
            Some(current) if renews_in_place(&current, &tariff.slug) => {
                let renewal = self
                    .renew_in(tx, &current, tariff, request.payment_method_ref.as_deref(), now)
                    .await?;
                Ok(Activation {
                    subscription: renewal.subscription,
                    kind: ActivationKind::Renewed,
                    transfers: renewal.transfer.into_iter().collect(),
                })
            }
            Some(current) => {
                let transfer = self.expire_in(tx, &current).await?;
                let subscription = create_in(tx, request, tariff, now).await?;
                info!(
                    account_id = request.account_id,
                    previous = %current.id,
                    subscription = %subscription.id,
                    tariff = %tariff.slug,
                    "replaced subscription"
                );
                Ok(Activation {
                    subscription,
                    kind: ActivationKind::Replaced {
                        previous_subscription_id: current.id,
                    },
                    transfers: transfer.into_iter().collect(),
                })
            }
            None => {
                let subscription = create_in(tx, request, tariff, now).await?;
                info!(
                    account_id = request.account_id,
                    subscription = %subscription.id,
                    tariff = %tariff.slug,
                    "activated subscription"
                );
                Ok(Activation {
                    subscription,
                    kind: ActivationKind::Created,
                    transfers: Vec::new(),
                })
            }
        }
    }

    pub async fn renew(
        &self,
        subscription_id: Uuid,
        payment_method_ref: Option<&str>,
    ) -> BillingResult<Renewal> {
        let current = self.get(subscription_id).await?;
        let tariff = self.subscription_tariff(&current.tariff_slug)?;

        let mut tx = self.pool.begin().await?;
        ledger::lock_account(&mut tx, current.account_id).await?;
        let current = subscription_for_update(&mut tx, subscription_id).await?;
        let renewal = self
            .renew_in(&mut tx, &current, tariff, payment_method_ref, Utc::now())
            .await?;
        tx.commit().await?;
        Ok(renewal)
    }

    pub(crate) async fn renew_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        current: &Subscription,
        tariff: &Tariff,
        payment_method_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<Renewal> {
        let terms = renewal_terms(current, tariff, now);

        let transfer = if terms.transferred > 0 {
            let entry = LedgerEntry::new(
                current.account_id,
                TransactionKind::SubscriptionTransfer,
                terms.transferred,
            )
            .describe("Unused subscription tokens moved to balance on renewal")
            .with_metadata(json!({
                "subscription_id": current.id,
                "tariff": tariff.slug,
                "reason": "renewal",
            }));
            Some(ledger::record_in(tx, entry).await?)
        } else {
            None
        };

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET period_start = $2,
                period_end = $3,
                tokens_per_period = $4,
                tokens_remaining = $5,
                status = 'active',
                renewal_attempts = 0,
                cancel_at_period_end = FALSE,
                auto_renewal = CASE WHEN $6::TEXT IS NULL THEN auto_renewal ELSE TRUE END,
                payment_method_ref = COALESCE($6, payment_method_ref),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(current.id)
        .bind(terms.period_start)
        .bind(terms.period_end)
        .bind(terms.tokens_per_period)
        .bind(terms.tokens_remaining)
        .bind(payment_method_ref)
        .fetch_one(&mut *tx)
        .await?;

        info!(
            account_id = current.account_id,
            subscription = %current.id,
            period_end = %terms.period_end,
            transferred = terms.transferred,
            burned = terms.burned,
            "renewed subscription"
        );

        Ok(Renewal {
            subscription: row.into(),
            transferred: terms.transferred,
            transfer,
        })
    }

    /// Decrements the pool only; the wallet share is returned for the caller to charge.
    pub async fn deduct_tokens(&self, account_id: i64, amount: i64) -> BillingResult<Allocation> {
        let mut tx = self.pool.begin().await?;
        let pool = usable_pool_for_update(&mut tx, account_id, Utc::now()).await?;
        let available = pool.as_ref().map_or(0, |sub| sub.tokens_remaining);
        let allocation = allocate(amount, available);
        if let Some(sub) = pool {
            consume_pool_in(&mut tx, sub.id, allocation.from_subscription).await?;
        }
        tx.commit().await?;
        Ok(allocation)
    }

    /// Stops auto-renewal. The pool stays usable until `period_end`, after which
    /// the scheduler expires it.
    pub async fn cancel(&self, subscription_id: Uuid, reason: &str) -> BillingResult<Subscription> {
        let current = self.get(subscription_id).await?;
        if !matches!(
            current.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        ) {
            debug!(subscription = %subscription_id, status = current.status.as_str(), "cancel is a no-op");
            return Ok(current);
        }

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                cancel_at_period_end = TRUE,
                auto_renewal = FALSE,
                metadata = metadata || jsonb_build_object('cancel_reason', $2::TEXT, 'canceled_at', NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'past_due')
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(account_id = row.account_id, subscription = %subscription_id, reason, "canceled subscription");
                Ok(row.into())
            }
            None => self.get(subscription_id).await,
        }
    }

    pub async fn expire(&self, subscription_id: Uuid) -> BillingResult<Expiry> {
        let current = self.get(subscription_id).await?;
        let mut tx = self.pool.begin().await?;
        ledger::lock_account(&mut tx, current.account_id).await?;
        let current = subscription_for_update(&mut tx, subscription_id).await?;
        let transfer = self.expire_in(&mut tx, &current).await?;
        let subscription = subscription_for_update(&mut tx, subscription_id).await?;
        tx.commit().await?;
        Ok(Expiry {
            subscription,
            transfer,
        })
    }

    /// Terminal transition. Leftover pool tokens go to the wallet unless the
    /// tariff burns them; the pool is zeroed either way.
    pub(crate) async fn expire_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        current: &Subscription,
    ) -> BillingResult<Option<LedgerTransaction>> {
        if current.status == SubscriptionStatus::Expired {
            return Ok(None);
        }

        let burn_unused = self
            .catalog
            .tariff(&current.tariff_slug)
            .map(|tariff| tariff.burn_unused);
        let amount = leftover_transfer(current.tokens_remaining, burn_unused);

        let transfer = if amount > 0 {
            let entry = LedgerEntry::new(
                current.account_id,
                TransactionKind::SubscriptionTransfer,
                amount,
            )
            .describe("Unused subscription tokens moved to balance on expiry")
            .with_metadata(json!({
                "subscription_id": current.id,
                "tariff": current.tariff_slug,
                "reason": "expiry",
            }));
            Some(ledger::record_in(tx, entry).await?)
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired',
                tokens_remaining = 0,
                auto_renewal = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(current.id)
        .execute(&mut *tx)
        .await?;

        info!(
            account_id = current.account_id,
            subscription = %current.id,
            transferred = amount,
            burned = current.tokens_remaining.max(0) - amount,
            "expired subscription"
        );
        Ok(transfer)
    }

    /// A failed attempt moves the subscription to past-due; success only resets the counter.
    pub async fn record_renewal_attempt(
        &self,
        subscription_id: Uuid,
        success: bool,
    ) -> BillingResult<Subscription> {
        let query = if success {
            r#"
            UPDATE subscriptions
            SET renewal_attempts = 0,
                last_renewal_attempt_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#
        } else {
            r#"
            UPDATE subscriptions
            SET renewal_attempts = renewal_attempts + 1,
                last_renewal_attempt_at = NOW(),
                status = 'past_due',
                updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'past_due')
            RETURNING *
            "#
        };
        let row = sqlx::query_as::<_, SubscriptionRow>(query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                if !success {
                    info!(
                        account_id = row.account_id,
                        subscription = %subscription_id,
                        attempts = row.renewal_attempts,
                        "renewal attempt failed"
                    );
                }
                Ok(row.into())
            }
            None => self.get(subscription_id).await,
        }
    }

    /// Active auto-renewing subscriptions whose period ends within `window`.
    pub async fn get_expiring(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active'
              AND auto_renewal = TRUE
              AND period_end <= $1
            ORDER BY period_end ASC
            "#,
        )
        .bind(now + window)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    /// Past-due subscriptions that still have renewal attempts left.
    pub async fn get_past_due(&self, max_attempts: i32) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'past_due'
              AND auto_renewal = TRUE
              AND renewal_attempts < $1
            ORDER BY period_end ASC
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    /// Past-due subscriptions out of attempts, plus lapsed ones nobody will renew.
    pub async fn due_for_expiry(
        &self,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE (status = 'past_due' AND renewal_attempts >= $1)
               OR (status IN ('active', 'canceled', 'past_due') AND auto_renewal = FALSE AND period_end <= $2)
            ORDER BY period_end ASC
            "#,
        )
        .bind(max_attempts)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    fn subscription_tariff(&self, slug: &str) -> BillingResult<&Tariff> {
        let tariff = self
            .catalog
            .tariff(slug)
            .ok_or_else(|| BillingError::TariffNotFound(slug.to_string()))?;
        if !tariff.is_subscription() {
            return Err(BillingError::TariffMismatch {
                tariff: slug.to_string(),
                reason: "not a subscription tariff".into(),
            });
        }
        Ok(tariff)
    }
}

async fn create_in(
    tx: &mut Transaction<'_, Postgres>,
    request: &ActivationRequest,
    tariff: &Tariff,
    now: DateTime<Utc>,
) -> BillingResult<Subscription> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        INSERT INTO subscriptions (
            id,
            account_id,
            tariff_slug,
            provider,
            payment_method_ref,
            tokens_per_period,
            tokens_remaining,
            period_start,
            period_end,
            status,
            auto_renewal,
            metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $8, 'active', $9, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request.account_id)
    .bind(&tariff.slug)
    .bind(&request.provider)
    .bind(request.payment_method_ref.as_deref())
    .bind(tariff.tokens_per_period)
    .bind(now)
    .bind(now + Duration::days(tariff.period_days))
    .bind(request.auto_renewal)
    .bind(json!({ "payment_id": request.payment_id }))
    .fetch_one(&mut *tx)
    .await?;
    Ok(row.into())
}

async fn live_for_update(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
) -> BillingResult<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT * FROM subscriptions WHERE account_id = $1 AND status <> 'expired' FOR UPDATE",
    )
    .bind(account_id)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(row.map(Subscription::from))
}

async fn subscription_for_update(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
) -> BillingResult<Subscription> {
    sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE")
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Subscription::from)
        .ok_or(BillingError::SubscriptionNotFound(subscription_id))
}

/// The live subscription if its pool can be spent at `now`, locked for the rest of `tx`.
pub(crate) async fn usable_pool_for_update(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
    now: DateTime<Utc>,
) -> BillingResult<Option<Subscription>> {
    Ok(live_for_update(tx, account_id)
        .await?
        .filter(|sub| sub.is_usable(now)))
}

pub(crate) async fn consume_pool_in(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    amount: i64,
) -> BillingResult<()> {
    if amount <= 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET tokens_remaining = tokens_remaining - $2,
            updated_at = NOW()
        WHERE id = $1 AND tokens_remaining >= $2
        "#,
    )
    .bind(subscription_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?;
    Ok(())
}
