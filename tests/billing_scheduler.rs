use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use token_billing::billing::models::PaymentStatus;
use token_billing::billing::payments::PaymentEffect;
use token_billing::billing::providers::{
    checkout_charge_id, ChargeReceipt, PaymentIntent, PaymentRequest, ProviderError,
    ProviderEvent, SavedMethodCharge, CHECKOUT_PROVIDER, STARS_PROVIDER,
};
use token_billing::billing::subscriptions::ActivationRequest;
use token_billing::billing::{
    run_billing_automation_tick, BillingContext, CheckoutProvider, PaymentProvider,
    ProviderRegistry, SchedulerSettings, StarsProvider, SubscriptionStatus, WebhookOutcome,
};
use token_billing::config::BillingCatalog;
use uuid::Uuid;

const AUTOPAY: &str = "autopay";

const CATALOG: &str = r#"
billing:
  enabled: true
  renewal_retry_days: 2
tariffs:
  pro_monthly:
    kind: subscription
    name: Pro
    tokens_per_period: 1000
    period_days: 30
    burn_unused: false
    prices:
      autopay: { amount: "690.00", currency: RUB }
      telegram_stars: { amount: 350, currency: XTR }
      checkout: { amount: "690.00", currency: RUB }
"#;

/// Charges saved methods synchronously; `pm_declined` always fails.
struct AutoPay;

#[async_trait]
impl PaymentProvider for AutoPay {
    fn name(&self) -> &str {
        AUTOPAY
    }

    async fn create_payment(&self, _request: &PaymentRequest) -> Result<PaymentIntent, ProviderError> {
        Err(ProviderError::Unsupported("interactive payments"))
    }

    async fn process_webhook(&self, _raw: &Value) -> Result<ProviderEvent, ProviderError> {
        Err(ProviderError::Unsupported("webhooks"))
    }

    async fn charge_saved_method(
        &self,
        charge: &SavedMethodCharge,
    ) -> Result<ChargeReceipt, ProviderError> {
        if charge.payment_method_ref == "pm_declined" {
            return Err(ProviderError::Declined("insufficient funds".into()));
        }
        Ok(ChargeReceipt {
            provider_payment_id: format!("auto_{}", charge.payment_id),
            status: PaymentStatus::Succeeded,
        })
    }
}

fn context(pool: &PgPool) -> BillingContext {
    let catalog = Arc::new(BillingCatalog::from_yaml_str(CATALOG).unwrap());
    let providers = ProviderRegistry::new()
        .with(AUTOPAY, Arc::new(AutoPay))
        .with(STARS_PROVIDER, Arc::new(StarsProvider))
        .with(
            CHECKOUT_PROVIDER,
            Arc::new(CheckoutProvider::new("https://pay.example.com")),
        );
    BillingContext::new(pool.clone(), catalog, Arc::new(providers))
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        renewal_lookahead: Duration::hours(24),
        retry_spacing: Duration::hours(24),
        managed_grace: Duration::hours(24),
    }
}

async fn subscribe(
    ctx: &BillingContext,
    pool: &PgPool,
    external_id: &str,
    provider: &str,
    payment_method_ref: Option<&str>,
    period_end: DateTime<Utc>,
) -> (i64, Uuid) {
    let account_id = ctx.accounts.register(external_id).await.unwrap().0.id;
    let activation = ctx
        .subscriptions
        .activate(ActivationRequest {
            account_id,
            tariff_slug: "pro_monthly".into(),
            provider: provider.into(),
            payment_method_ref: payment_method_ref.map(str::to_string),
            auto_renewal: true,
            payment_id: None,
        })
        .await
        .unwrap();
    sqlx::query("UPDATE subscriptions SET period_end = $2 WHERE id = $1")
        .bind(activation.subscription.id)
        .bind(period_end)
        .execute(pool)
        .await
        .unwrap();
    (account_id, activation.subscription.id)
}

// key: billing-scheduler-tests -> renewals, retries, expiry
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn due_subscription_is_charged_and_renewed_in_place(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ctx = context(&pool);
    let now = Utc::now();
    let (account_id, subscription_id) = subscribe(
        &ctx,
        &pool,
        "renewer",
        AUTOPAY,
        Some("pm_ok"),
        now + Duration::hours(2),
    )
    .await;
    sqlx::query("UPDATE subscriptions SET tokens_remaining = 40 WHERE id = $1")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();
    let stored_end = ctx.subscriptions.get(subscription_id).await.unwrap().period_end;

    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.renewed, 1);
    assert_eq!(report.renewal_failures, 0);

    let renewed = ctx.subscriptions.get(subscription_id).await.unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.period_end, stored_end + Duration::days(30));
    assert_eq!(renewed.tokens_remaining, 1000);
    // burn_unused = false: leftover moved to the wallet.
    assert_eq!(ctx.accounts.get(account_id).await.unwrap().balance, 40);

    let (status, recurring): (String, bool) = sqlx::query_as(
        "SELECT status, is_recurring FROM payments WHERE account_id = $1",
    )
    .bind(account_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "succeeded");
    assert!(recurring);

    // Nothing is due any more.
    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.renewed, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn declined_renewals_retry_then_expire(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ctx = context(&pool);
    let now = Utc::now();
    let (_, subscription_id) = subscribe(
        &ctx,
        &pool,
        "declined",
        AUTOPAY,
        Some("pm_declined"),
        now + Duration::hours(2),
    )
    .await;

    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.renewal_failures, 1);
    let past_due = ctx.subscriptions.get(subscription_id).await.unwrap();
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    assert_eq!(past_due.renewal_attempts, 1);

    // Too soon for another attempt.
    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.renewal_failures, 0);

    let later = now + Duration::hours(25);
    let report = run_billing_automation_tick(&ctx, later, &settings()).await.unwrap();
    assert_eq!(report.renewal_failures, 1);
    assert_eq!(
        ctx.subscriptions.get(subscription_id).await.unwrap().renewal_attempts,
        2
    );

    let exhausted = now + Duration::hours(50);
    let report = run_billing_automation_tick(&ctx, exhausted, &settings()).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(
        ctx.subscriptions.get(subscription_id).await.unwrap().status,
        SubscriptionStatus::Expired
    );

    let failed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE status = 'failed'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed, 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provider_managed_renewal_expires_after_grace(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ctx = context(&pool);
    let now = Utc::now();
    let (_, waiting) = subscribe(
        &ctx,
        &pool,
        "stars-waiting",
        STARS_PROVIDER,
        None,
        now - Duration::hours(2),
    )
    .await;
    let (_, lapsed) = subscribe(
        &ctx,
        &pool,
        "stars-lapsed",
        STARS_PROVIDER,
        None,
        now - Duration::days(2),
    )
    .await;

    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.expired, 1);
    assert_eq!(
        ctx.subscriptions.get(waiting).await.unwrap().status,
        SubscriptionStatus::Active
    );
    assert_eq!(
        ctx.subscriptions.get(lapsed).await.unwrap().status,
        SubscriptionStatus::Expired
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn canceled_subscription_expires_at_period_end(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ctx = context(&pool);
    let now = Utc::now();
    let (account_id, subscription_id) = subscribe(
        &ctx,
        &pool,
        "canceler",
        AUTOPAY,
        Some("pm_ok"),
        now + Duration::days(3),
    )
    .await;
    ctx.subscriptions
        .cancel(subscription_id, "moving on")
        .await
        .unwrap();

    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.expired, 0);
    assert_eq!(report.renewed, 0);

    let report = run_billing_automation_tick(&ctx, now + Duration::days(4), &settings())
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    // Untouched pool of 1000 moves to the wallet: the tariff keeps unused tokens.
    assert_eq!(ctx.accounts.get(account_id).await.unwrap().balance, 1000);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pending_renewal_charge_is_settled_by_gateway_webhook(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ctx = context(&pool);
    let now = Utc::now();
    let (_, subscription_id) = subscribe(
        &ctx,
        &pool,
        "checkout-renewer",
        CHECKOUT_PROVIDER,
        Some("pm_ok"),
        now + Duration::hours(2),
    )
    .await;
    let stored_end = ctx.subscriptions.get(subscription_id).await.unwrap().period_end;

    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.awaiting_provider, 1);
    assert_eq!(report.renewal_failures, 0);
    let waiting = ctx.subscriptions.get(subscription_id).await.unwrap();
    assert_eq!(waiting.status, SubscriptionStatus::Active);
    assert_eq!(waiting.renewal_attempts, 0);

    let (payment_id, provider_payment_id): (uuid::Uuid, Option<String>) = sqlx::query_as(
        "SELECT id, provider_payment_id FROM payments WHERE status = 'pending'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let gateway_id = checkout_charge_id(payment_id);
    assert_eq!(provider_payment_id.as_deref(), Some(gateway_id.as_str()));

    // A charge still in flight is not submitted twice.
    let report = run_billing_automation_tick(&ctx, now, &settings()).await.unwrap();
    assert_eq!(report.awaiting_provider, 1);
    let charges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(charges, 1);

    // The gateway confirms with its own id only.
    let outcome = ctx
        .payments
        .process_event(
            CHECKOUT_PROVIDER,
            &json!({
                "event": "payment.succeeded",
                "object": { "id": gateway_id },
            }),
        )
        .await
        .unwrap();
    let WebhookOutcome::Applied { payment, effect, .. } = outcome else {
        panic!("expected the confirmation to apply");
    };
    assert_eq!(payment.id, payment_id);
    assert!(matches!(effect, PaymentEffect::Activated { .. }));

    let renewed = ctx.subscriptions.get(subscription_id).await.unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.period_end, stored_end + Duration::days(30));
}
