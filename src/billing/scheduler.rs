use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config;

use super::error::BillingResult;
use super::models::{PaymentStatus, Subscription};
use super::providers::SavedMethodCharge;
use super::BillingContext;

/// Windows the renewal tick works with.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// How far ahead of `period_end` a renewal is charged.
    pub renewal_lookahead: Duration,
    /// Minimum gap between two attempts on a past-due subscription.
    pub retry_spacing: Duration,
    /// How long a provider-managed subscription may lapse before it is expired.
    pub managed_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_env() -> Self {
        Self {
            renewal_lookahead: Duration::hours(*config::BILLING_RENEWAL_LOOKAHEAD_HOURS),
            retry_spacing: Duration::hours(*config::BILLING_RENEWAL_RETRY_SPACING_HOURS),
            managed_grace: Duration::hours(*config::BILLING_MANAGED_RENEWAL_GRACE_HOURS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub expired: usize,
    pub renewed: usize,
    pub awaiting_provider: usize,
    pub renewal_failures: usize,
    pub skipped: usize,
}

impl TickReport {
    fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewalAttempt {
    Renewed,
    AwaitingProvider,
    Failed,
    Expired,
    Skipped,
}

/// key: billing-renewal-scheduler -> charge due renewals and expire lapsed subscriptions
pub fn spawn(ctx: BillingContext) {
    let interval = TokioDuration::from_secs(*config::BILLING_SCHEDULER_INTERVAL_SECS);
    let settings = SchedulerSettings::from_env();

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match process_tick(&ctx, Utc::now(), &settings).await {
                Ok(report) if !report.is_idle() => info!(?report, "billing renewal tick"),
                Ok(_) => {}
                Err(err) => warn!(?err, "billing renewal tick failed"),
            }
        }
    });
}

/// key: billing-renewal-scheduler -> tick handler
///
/// Expiry runs first so a subscription is never charged in the same tick it lapses.
/// Failures on a single subscription are logged and do not abort the tick.
pub async fn process_tick(
    ctx: &BillingContext,
    now: DateTime<Utc>,
    settings: &SchedulerSettings,
) -> Result<TickReport> {
    let mut report = TickReport::default();
    let max_attempts = ctx.catalog.billing.renewal_retry_days;

    for subscription in ctx.subscriptions.due_for_expiry(max_attempts, now).await? {
        match ctx.subscriptions.expire(subscription.id).await {
            Ok(_) => report.expired += 1,
            Err(err) => warn!(
                ?err,
                subscription = %subscription.id,
                account_id = subscription.account_id,
                "failed to expire subscription"
            ),
        }
    }

    let mut candidates = ctx
        .subscriptions
        .get_expiring(settings.renewal_lookahead, now)
        .await?;
    candidates.extend(
        ctx.subscriptions
            .get_past_due(max_attempts)
            .await?
            .into_iter()
            .filter(|subscription| retry_due(subscription, now, settings.retry_spacing)),
    );

    for subscription in candidates {
        match attempt_renewal(ctx, &subscription, now, settings).await {
            Ok(RenewalAttempt::Renewed) => report.renewed += 1,
            Ok(RenewalAttempt::AwaitingProvider) => report.awaiting_provider += 1,
            Ok(RenewalAttempt::Failed) => report.renewal_failures += 1,
            Ok(RenewalAttempt::Expired) => report.expired += 1,
            Ok(RenewalAttempt::Skipped) => report.skipped += 1,
            Err(err) => {
                report.renewal_failures += 1;
                warn!(
                    ?err,
                    subscription = %subscription.id,
                    account_id = subscription.account_id,
                    "renewal attempt errored"
                );
            }
        }
    }

    Ok(report)
}

/// Whether a past-due subscription has waited long enough since its last attempt.
pub fn retry_due(subscription: &Subscription, now: DateTime<Utc>, spacing: Duration) -> bool {
    subscription
        .last_renewal_attempt_at
        .map_or(true, |last| last + spacing <= now)
}

async fn attempt_renewal(
    ctx: &BillingContext,
    subscription: &Subscription,
    now: DateTime<Utc>,
    settings: &SchedulerSettings,
) -> BillingResult<RenewalAttempt> {
    let Some(provider) = ctx.providers.get(&subscription.provider) else {
        return fail_attempt(ctx, subscription, "payment provider not configured").await;
    };

    if provider.manages_renewals() {
        if subscription.period_end + settings.managed_grace <= now {
            ctx.subscriptions.expire(subscription.id).await?;
            info!(
                subscription = %subscription.id,
                account_id = subscription.account_id,
                provider = %subscription.provider,
                "provider renewal never arrived; subscription expired"
            );
            return Ok(RenewalAttempt::Expired);
        }
        debug!(subscription = %subscription.id, "renewal is pushed by the provider");
        return Ok(RenewalAttempt::Skipped);
    }

    if ctx
        .payments
        .pending_renewal_for(subscription.id, now - settings.retry_spacing)
        .await?
        .is_some()
    {
        return Ok(RenewalAttempt::AwaitingProvider);
    }

    let Some(payment_method_ref) = subscription.payment_method_ref.as_deref() else {
        return fail_attempt(ctx, subscription, "no saved payment method").await;
    };
    let Some(tariff) = ctx
        .catalog
        .tariff(&subscription.tariff_slug)
        .filter(|tariff| tariff.is_subscription())
    else {
        return fail_attempt(ctx, subscription, "tariff no longer offered").await;
    };
    let Some(price) = tariff.price_for(&subscription.provider) else {
        return fail_attempt(ctx, subscription, "tariff has no price for provider").await;
    };

    let payment = ctx
        .payments
        .begin_renewal_charge(subscription, tariff, price)
        .await?;
    let charge = SavedMethodCharge {
        payment_id: payment.id,
        amount: price.amount,
        currency: price.currency.clone(),
        payment_method_ref: payment_method_ref.to_string(),
        description: format!("{} renewal", tariff.name),
    };

    match provider.charge_saved_method(&charge).await {
        Ok(receipt) => {
            ctx.payments.settle_direct_charge(&payment, &receipt).await?;
            match receipt.status {
                PaymentStatus::Succeeded => {
                    ctx.subscriptions
                        .record_renewal_attempt(subscription.id, true)
                        .await?;
                    Ok(RenewalAttempt::Renewed)
                }
                PaymentStatus::Pending => Ok(RenewalAttempt::AwaitingProvider),
                status => {
                    fail_attempt(ctx, subscription, &format!("charge {}", status.as_str())).await
                }
            }
        }
        Err(err) => {
            ctx.payments.mark_failed(payment.id, &err.to_string()).await?;
            fail_attempt(ctx, subscription, &err.to_string()).await
        }
    }
}

async fn fail_attempt(
    ctx: &BillingContext,
    subscription: &Subscription,
    reason: &str,
) -> BillingResult<RenewalAttempt> {
    warn!(
        subscription = %subscription.id,
        account_id = subscription.account_id,
        reason,
        "renewal attempt failed"
    );
    ctx.subscriptions
        .record_renewal_attempt(subscription.id, false)
        .await?;
    Ok(RenewalAttempt::Failed)
}
