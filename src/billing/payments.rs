use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BillingCatalog, Tariff, TariffPrice};

use super::error::{BillingError, BillingResult};
use super::ledger::{self, LedgerEntry};
use super::models::{
    LedgerTransaction, Payment, PaymentRow, PaymentStatus, Subscription, TransactionKind,
};
use super::providers::{
    ChargeReceipt, PaymentProvider, PaymentRequest, ProviderEvent, ProviderRegistry,
    RecurringSignal,
};
use super::referrals::ReferralLedger;
use super::subscriptions::{Activation, ActivationRequest, SubscriptionManager};

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentRecord {
    pub payment: Payment,
    pub confirmation_url: Option<String>,
    pub provider_payload: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PaymentEffect {
    Credited { transaction: LedgerTransaction },
    Activated { activation: Activation },
    Closed { status: PaymentStatus },
    Refunded { transaction: Option<LedgerTransaction> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        payment: Payment,
        effect: PaymentEffect,
        referral_bonus: Option<LedgerTransaction>,
    },
    /// The event was already applied; nothing changed.
    Duplicate {
        payment_id: Option<Uuid>,
        external_id: String,
    },
    Unmatched {
        external_id: String,
    },
    Ignored {
        payment_id: Uuid,
        reason: String,
    },
}

/// key: payment-reconciler -> provider events to credits and activations, exactly once
#[derive(Clone)]
pub struct PaymentReconciler {
    pool: PgPool,
    catalog: Arc<BillingCatalog>,
    providers: Arc<ProviderRegistry>,
    subscriptions: SubscriptionManager,
    referrals: ReferralLedger,
}

impl PaymentReconciler {
    pub fn new(
        pool: PgPool,
        catalog: Arc<BillingCatalog>,
        providers: Arc<ProviderRegistry>,
        subscriptions: SubscriptionManager,
        referrals: ReferralLedger,
    ) -> Self {
        Self {
            pool,
            catalog,
            providers,
            subscriptions,
            referrals,
        }
    }

    pub fn provider(&self, name: &str) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| BillingError::ProviderNotConfigured(name.to_string()))
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<Payment> {
        sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::from)
            .ok_or(BillingError::PaymentNotFound(payment_id))
    }

    /// Asks the provider for an intent and stores a pending payment keyed by a fresh internal id.
    pub async fn create_intent(
        &self,
        account_id: i64,
        tariff_slug: &str,
        provider_name: &str,
        return_url: Option<String>,
    ) -> BillingResult<PaymentIntentRecord> {
        let tariff = self
            .catalog
            .tariff(tariff_slug)
            .filter(|tariff| tariff.enabled)
            .ok_or_else(|| BillingError::TariffNotFound(tariff_slug.to_string()))?;
        let provider = self.provider(provider_name)?;
        let price = tariff
            .price_for(provider_name)
            .ok_or_else(|| BillingError::TariffMismatch {
                tariff: tariff_slug.to_string(),
                reason: format!("no price for provider `{provider_name}`"),
            })?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(BillingError::AccountNotFound(account_id));
        }

        let payment_id = Uuid::new_v4();
        let intent = provider
            .create_payment(&PaymentRequest {
                payment_id,
                amount: price.amount,
                currency: price.currency.clone(),
                description: tariff.name.clone(),
                tariff_slug: tariff.slug.clone(),
                recurring: tariff.is_subscription(),
                return_url,
            })
            .await?;

        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (
                id,
                account_id,
                provider,
                provider_payment_id,
                amount,
                currency,
                tariff_slug,
                tokens_amount,
                status,
                is_recurring,
                confirmation_url,
                metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(account_id)
        .bind(provider_name)
        .bind(intent.provider_payment_id.as_deref())
        .bind(price.amount)
        .bind(&price.currency)
        .bind(&tariff.slug)
        .bind(tariff.effective_tokens())
        .bind(tariff.is_subscription())
        .bind(intent.confirmation_url.as_deref())
        .bind(json!({ "tariff": tariff.slug, "provider_payload": intent.payload }))
        .fetch_one(&self.pool)
        .await?;

        info!(
            account_id,
            payment = %payment_id,
            provider = provider_name,
            tariff = %tariff.slug,
            amount = %price.amount,
            "payment intent created"
        );

        Ok(PaymentIntentRecord {
            payment: row.into(),
            confirmation_url: intent.confirmation_url,
            provider_payload: intent.payload,
        })
    }

    /// Normalizes a raw webhook and applies it. Replays and out-of-order
    /// deliveries resolve to `Duplicate` / `Ignored` before anything is written.
    pub async fn process_event(&self, provider_name: &str, raw: &Value) -> BillingResult<WebhookOutcome> {
        let provider = self.provider(provider_name)?;
        let event = provider.process_webhook(raw).await?;
        self.apply_event(provider_name, &event).await
    }

    /// Result of a merchant-initiated charge, applied like a webhook for that payment.
    pub async fn settle_direct_charge(
        &self,
        payment: &Payment,
        receipt: &ChargeReceipt,
    ) -> BillingResult<WebhookOutcome> {
        let event = ProviderEvent {
            external_id: receipt.provider_payment_id.clone(),
            status: receipt.status,
            amount: Some(payment.amount),
            currency: Some(payment.currency.clone()),
            metadata: json!({ "payment_id": payment.id }),
            payment_method_ref: None,
            recurring: RecurringSignal::None,
        };
        self.apply_event(&payment.provider, &event).await
    }

    /// Pending recurring payment for a scheduler-driven renewal charge.
    pub async fn begin_renewal_charge(
        &self,
        subscription: &Subscription,
        tariff: &Tariff,
        price: &TariffPrice,
    ) -> BillingResult<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (
                id,
                account_id,
                provider,
                amount,
                currency,
                tariff_slug,
                tokens_amount,
                status,
                is_recurring,
                payment_method_ref,
                metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', TRUE, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription.account_id)
        .bind(&subscription.provider)
        .bind(price.amount)
        .bind(&price.currency)
        .bind(&tariff.slug)
        .bind(tariff.tokens_per_period)
        .bind(subscription.payment_method_ref.as_deref())
        .bind(json!({ "subscription_id": subscription.id, "renewal": true }))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// A renewal charge for `subscription_id` still waiting on the provider.
    pub async fn pending_renewal_for(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> BillingResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT * FROM payments
            WHERE status = 'pending'
              AND metadata->>'subscription_id' = $1
              AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id.to_string())
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Payment::from))
    }

    /// Closes a pending payment the provider refused before any webhook arrived.
    pub async fn mark_failed(&self, payment_id: Uuid, reason: &str) -> BillingResult<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            UPDATE payments
            SET status = 'failed',
                metadata = metadata || jsonb_build_object('error', $2::TEXT),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.into()),
            None => self.get(payment_id).await,
        }
    }

    async fn apply_event(&self, provider_name: &str, event: &ProviderEvent) -> BillingResult<WebhookOutcome> {
        match self.apply_event_once(provider_name, event).await {
            // A concurrent delivery of the same event won the race on the unique key.
            Err(err) if err.is_duplicate_payment() => {
                info!(
                    provider = provider_name,
                    external_id = %event.external_id,
                    "concurrent duplicate payment event"
                );
                Ok(WebhookOutcome::Duplicate {
                    payment_id: event.internal_payment_id(),
                    external_id: event.external_id.clone(),
                })
            }
            other => other,
        }
    }

    async fn apply_event_once(
        &self,
        provider_name: &str,
        event: &ProviderEvent,
    ) -> BillingResult<WebhookOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = if event.recurring == RecurringSignal::Renewal {
            self.apply_renewal_in(&mut tx, provider_name, event).await?
        } else {
            match find_payment_in(&mut tx, provider_name, event).await? {
                Some(payment) => self.transition_in(&mut tx, payment, event).await?,
                None => {
                    warn!(
                        provider = provider_name,
                        external_id = %event.external_id,
                        "payment event matches no payment"
                    );
                    WebhookOutcome::Unmatched {
                        external_id: event.external_id.clone(),
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn transition_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: Payment,
        event: &ProviderEvent,
    ) -> BillingResult<WebhookOutcome> {
        match (payment.status, event.status) {
            (current, incoming) if current == incoming && current != PaymentStatus::Pending => {
                info!(payment = %payment.id, status = current.as_str(), "duplicate payment event");
                Ok(WebhookOutcome::Duplicate {
                    payment_id: Some(payment.id),
                    external_id: event.external_id.clone(),
                })
            }
            (PaymentStatus::Pending, PaymentStatus::Succeeded) => {
                self.settle_in(tx, payment, event).await
            }
            (PaymentStatus::Succeeded, PaymentStatus::Refunded) => {
                self.refund_in(tx, payment, event).await
            }
            (PaymentStatus::Pending, PaymentStatus::Pending) => {
                // Keep the provider id so a confirmation carrying only that id still matches.
                let payment = set_status_in(tx, &payment, PaymentStatus::Pending, event).await?;
                Ok(WebhookOutcome::Ignored {
                    payment_id: payment.id,
                    reason: "payment still pending".into(),
                })
            }
            (PaymentStatus::Pending, status) => {
                let payment = set_status_in(tx, &payment, status, event).await?;
                info!(
                    account_id = payment.account_id,
                    payment = %payment.id,
                    status = status.as_str(),
                    "payment closed without success"
                );
                Ok(WebhookOutcome::Applied {
                    payment,
                    effect: PaymentEffect::Closed { status },
                    referral_bonus: None,
                })
            }
            (current, incoming) => {
                warn!(
                    payment = %payment.id,
                    current = current.as_str(),
                    incoming = incoming.as_str(),
                    "ignoring out-of-order payment event"
                );
                Ok(WebhookOutcome::Ignored {
                    payment_id: payment.id,
                    reason: format!(
                        "payment is {}, cannot move to {}",
                        current.as_str(),
                        incoming.as_str()
                    ),
                })
            }
        }
    }

    /// Marks the payment succeeded and applies exactly one effect: a purchase
    /// credit for one-time tariffs or an activation for subscription tariffs.
    /// A tariff removed from the catalog still credits the stored token amount.
    async fn settle_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: Payment,
        event: &ProviderEvent,
    ) -> BillingResult<WebhookOutcome> {
        let payment = set_status_in(tx, &payment, PaymentStatus::Succeeded, event).await?;

        let effect = match self.catalog.tariff(&payment.tariff_slug) {
            Some(tariff) if tariff.is_subscription() => {
                let request = ActivationRequest {
                    account_id: payment.account_id,
                    tariff_slug: payment.tariff_slug.clone(),
                    provider: payment.provider.clone(),
                    payment_method_ref: payment.payment_method_ref.clone(),
                    auto_renewal: payment.payment_method_ref.is_some()
                        || event.recurring != RecurringSignal::None,
                    payment_id: Some(payment.id),
                };
                let activation = self
                    .subscriptions
                    .activate_in(tx, &request, Utc::now())
                    .await?;
                PaymentEffect::Activated { activation }
            }
            _ => {
                let entry = LedgerEntry::new(
                    payment.account_id,
                    TransactionKind::Purchase,
                    payment.tokens_amount,
                )
                .describe(format!("Purchase of {}", payment.tariff_slug))
                .with_metadata(json!({
                    "payment_id": payment.id,
                    "provider": payment.provider,
                    "tariff": payment.tariff_slug,
                }));
                let transaction = ledger::record_in(tx, entry).await?;
                PaymentEffect::Credited { transaction }
            }
        };

        let program = &self.catalog.referral;
        let referral_bonus = if program.enabled && program.require_payment {
            self.referrals
                .pay_pending_bonus_in(tx, payment.account_id)
                .await?
        } else {
            None
        };

        info!(
            account_id = payment.account_id,
            payment = %payment.id,
            provider = %payment.provider,
            tariff = %payment.tariff_slug,
            tokens = payment.tokens_amount,
            "payment settled"
        );

        Ok(WebhookOutcome::Applied {
            payment,
            effect,
            referral_bonus,
        })
    }

    /// Provider-pushed renewal: a new payment keyed by the renewal's own external id,
    /// linked to the payment that started the subscription.
    async fn apply_renewal_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        provider_name: &str,
        event: &ProviderEvent,
    ) -> BillingResult<WebhookOutcome> {
        if let Some(existing) =
            payment_by_external_id_in(tx, provider_name, &event.external_id).await?
        {
            info!(payment = %existing.id, "duplicate renewal event");
            return Ok(WebhookOutcome::Duplicate {
                payment_id: Some(existing.id),
                external_id: event.external_id.clone(),
            });
        }

        let original = match event.internal_payment_id() {
            Some(id) => payment_for_update_in(tx, id).await?,
            None => None,
        };
        let Some(original) = original else {
            warn!(
                provider = provider_name,
                external_id = %event.external_id,
                "renewal event has no originating payment"
            );
            return Ok(WebhookOutcome::Unmatched {
                external_id: event.external_id.clone(),
            });
        };
        if original.provider != provider_name {
            return Err(BillingError::ProviderMismatch {
                payment_id: original.id,
                expected: original.provider,
                actual: provider_name.to_string(),
            });
        }
        if event.status != PaymentStatus::Succeeded {
            return Ok(WebhookOutcome::Ignored {
                payment_id: original.id,
                reason: format!("renewal reported as {}", event.status.as_str()),
            });
        }

        let tokens_amount = self
            .catalog
            .tariff(&original.tariff_slug)
            .map_or(original.tokens_amount, Tariff::effective_tokens);

        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (
                id,
                account_id,
                provider,
                provider_payment_id,
                parent_payment_id,
                amount,
                currency,
                tariff_slug,
                tokens_amount,
                status,
                is_recurring,
                payment_method_ref,
                metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', TRUE, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(original.account_id)
        .bind(provider_name)
        .bind(&event.external_id)
        .bind(original.id)
        .bind(event.amount.unwrap_or(original.amount))
        .bind(event.currency.as_deref().unwrap_or(&original.currency))
        .bind(&original.tariff_slug)
        .bind(tokens_amount)
        .bind(original.payment_method_ref.as_deref())
        .bind(json!({ "renewal_of": original.id }))
        .fetch_one(&mut *tx)
        .await?;

        self.settle_in(tx, row.into(), event).await
    }

    /// Debits what is left of a refunded one-time purchase, never below zero.
    async fn refund_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: Payment,
        event: &ProviderEvent,
    ) -> BillingResult<WebhookOutcome> {
        let payment = set_status_in(tx, &payment, PaymentStatus::Refunded, event).await?;
        let is_subscription = self
            .catalog
            .tariff(&payment.tariff_slug)
            .map_or(false, Tariff::is_subscription);

        let transaction = if is_subscription {
            warn!(
                account_id = payment.account_id,
                payment = %payment.id,
                "subscription payment refunded; subscription left untouched"
            );
            None
        } else {
            let account = ledger::lock_account(tx, payment.account_id).await?;
            let amount = payment.tokens_amount.min(account.balance.max(0));
            if amount > 0 {
                let entry = LedgerEntry::new(payment.account_id, TransactionKind::Refund, -amount)
                    .describe(format!("Refund of {}", payment.tariff_slug))
                    .with_metadata(json!({
                        "payment_id": payment.id,
                        "requested": payment.tokens_amount,
                    }));
                Some(ledger::record_in(tx, entry).await?)
            } else {
                None
            }
        };

        info!(account_id = payment.account_id, payment = %payment.id, "payment refunded");
        Ok(WebhookOutcome::Applied {
            payment,
            effect: PaymentEffect::Refunded { transaction },
            referral_bonus: None,
        })
    }
}

/// Internal id from metadata first, then the provider's own id.
async fn find_payment_in(
    tx: &mut Transaction<'_, Postgres>,
    provider_name: &str,
    event: &ProviderEvent,
) -> BillingResult<Option<Payment>> {
    if let Some(payment_id) = event.internal_payment_id() {
        if let Some(payment) = payment_for_update_in(tx, payment_id).await? {
            if payment.provider != provider_name {
                return Err(BillingError::ProviderMismatch {
                    payment_id,
                    expected: payment.provider,
                    actual: provider_name.to_string(),
                });
            }
            return Ok(Some(payment));
        }
    }
    payment_by_external_id_in(tx, provider_name, &event.external_id).await
}

async fn payment_for_update_in(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
) -> BillingResult<Option<Payment>> {
    let row = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?;
    Ok(row.map(Payment::from))
}

async fn payment_by_external_id_in(
    tx: &mut Transaction<'_, Postgres>,
    provider_name: &str,
    external_id: &str,
) -> BillingResult<Option<Payment>> {
    let row = sqlx::query_as::<_, PaymentRow>(
        "SELECT * FROM payments WHERE provider = $1 AND provider_payment_id = $2 FOR UPDATE",
    )
    .bind(provider_name)
    .bind(external_id)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(row.map(Payment::from))
}

/// Also attaches the provider id and saved method the first time the provider reports them.
async fn set_status_in(
    tx: &mut Transaction<'_, Postgres>,
    payment: &Payment,
    status: PaymentStatus,
    event: &ProviderEvent,
) -> BillingResult<Payment> {
    let row = sqlx::query_as::<_, PaymentRow>(
        r#"
        UPDATE payments
        SET status = $2,
            provider_payment_id = COALESCE(provider_payment_id, $3),
            payment_method_ref = COALESCE($4, payment_method_ref),
            completed_at = CASE WHEN $2 = 'pending' THEN completed_at ELSE NOW() END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment.id)
    .bind(status.as_str())
    .bind(&event.external_id)
    .bind(event.payment_method_ref.as_deref())
    .fetch_one(&mut *tx)
    .await?;
    Ok(row.into())
}
