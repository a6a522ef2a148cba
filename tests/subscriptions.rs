use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use token_billing::billing::subscriptions::{ActivationKind, ActivationRequest};
use token_billing::billing::{
    AccountService, Ledger, SubscriptionManager, SubscriptionStatus, TransactionKind,
};
use token_billing::config::BillingCatalog;
use uuid::Uuid;

const CATALOG: &str = r#"
billing:
  enabled: true
tariffs:
  keep_monthly:
    kind: subscription
    name: Keep
    tokens_per_period: 1000
    period_days: 30
    burn_unused: false
  burn_monthly:
    kind: subscription
    name: Burn
    tokens_per_period: 500
    period_days: 30
    burn_unused: true
"#;

fn catalog() -> Arc<BillingCatalog> {
    Arc::new(BillingCatalog::from_yaml_str(CATALOG).unwrap())
}

async fn new_account(pool: &PgPool, external_id: &str) -> i64 {
    AccountService::new(pool.clone(), catalog())
        .register(external_id)
        .await
        .unwrap()
        .0
        .id
}

fn request(account_id: i64, tariff: &str) -> ActivationRequest {
    ActivationRequest {
        account_id,
        tariff_slug: tariff.into(),
        provider: "checkout".into(),
        payment_method_ref: Some("pm_1".into()),
        auto_renewal: true,
        payment_id: None,
    }
}

async fn set_pool(pool: &PgPool, subscription_id: Uuid, tokens: i64) {
    sqlx::query("UPDATE subscriptions SET tokens_remaining = $2 WHERE id = $1")
        .bind(subscription_id)
        .bind(tokens)
        .execute(pool)
        .await
        .unwrap();
}

async fn wallet(pool: &PgPool, account_id: i64) -> i64 {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

// key: subscription-tests -> expiry transfer, replacement, cancellation, renewal policy
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expiry_transfers_leftover_when_tariff_keeps_tokens(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = new_account(&pool, "keeper").await;
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let activation = manager
        .activate(request(account_id, "keep_monthly"))
        .await
        .unwrap();
    set_pool(&pool, activation.subscription.id, 40).await;

    let expiry = manager.expire(activation.subscription.id).await.unwrap();
    let transfer = expiry.transfer.unwrap();
    assert_eq!(transfer.kind, TransactionKind::SubscriptionTransfer);
    assert_eq!(transfer.amount, 40);
    assert_eq!(expiry.subscription.status, SubscriptionStatus::Expired);
    assert_eq!(expiry.subscription.tokens_remaining, 0);
    assert_eq!(wallet(&pool, account_id).await, 40);

    // Expiring again is a no-op.
    let again = manager.expire(activation.subscription.id).await.unwrap();
    assert!(again.transfer.is_none());
    assert_eq!(wallet(&pool, account_id).await, 40);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expiry_burns_leftover_when_tariff_says_so(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = new_account(&pool, "burner").await;
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let activation = manager
        .activate(request(account_id, "burn_monthly"))
        .await
        .unwrap();
    set_pool(&pool, activation.subscription.id, 40).await;

    let expiry = manager.expire(activation.subscription.id).await.unwrap();
    assert!(expiry.transfer.is_none());
    assert_eq!(wallet(&pool, account_id).await, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn switching_tariff_expires_the_old_subscription_first(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = new_account(&pool, "switcher").await;
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let old = manager
        .activate(request(account_id, "keep_monthly"))
        .await
        .unwrap();
    set_pool(&pool, old.subscription.id, 300).await;

    let new = manager
        .activate(request(account_id, "burn_monthly"))
        .await
        .unwrap();
    assert!(matches!(
        new.kind,
        ActivationKind::Replaced { previous_subscription_id } if previous_subscription_id == old.subscription.id
    ));
    assert_eq!(new.transfers.len(), 1);
    assert_eq!(wallet(&pool, account_id).await, 300);

    let live = manager.active_subscription(account_id).await.unwrap().unwrap();
    assert_eq!(live.id, new.subscription.id);
    assert_eq!(live.tokens_remaining, 500);
    assert_eq!(
        manager.get(old.subscription.id).await.unwrap().status,
        SubscriptionStatus::Expired
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn canceled_subscription_stays_usable_until_period_end(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = new_account(&pool, "leaver").await;
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let activation = manager
        .activate(request(account_id, "keep_monthly"))
        .await
        .unwrap();

    let canceled = manager
        .cancel(activation.subscription.id, "too expensive")
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(canceled.cancel_at_period_end);
    assert!(!canceled.auto_renewal);
    assert_eq!(canceled.metadata["cancel_reason"], "too expensive");

    let allocation = manager.deduct_tokens(account_id, 100).await.unwrap();
    assert_eq!(allocation.from_subscription, 100);
    assert_eq!(allocation.from_balance, 0);

    let info = manager
        .subscription_info(account_id, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.usable_tokens, 900);
    assert_eq!(info.tariff_name.as_deref(), Some("Keep"));

    let expiring = manager.get_expiring(Duration::days(60), Utc::now()).await.unwrap();
    assert!(expiring.is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_renewal_attempts_move_to_past_due(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let account_id = new_account(&pool, "declined").await;
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let activation = manager
        .activate(request(account_id, "keep_monthly"))
        .await
        .unwrap();
    let id = activation.subscription.id;

    for _ in 0..2 {
        manager.record_renewal_attempt(id, false).await.unwrap();
    }
    let past_due = manager.get(id).await.unwrap();
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    assert_eq!(past_due.renewal_attempts, 2);

    assert_eq!(manager.get_past_due(3).await.unwrap().len(), 1);
    assert!(manager.get_past_due(2).await.unwrap().is_empty());
    assert_eq!(manager.due_for_expiry(2, Utc::now()).await.unwrap().len(), 1);

    // A successful renewal of a past-due subscription restores it.
    let renewal = manager.renew(id, None).await.unwrap();
    assert_eq!(renewal.subscription.status, SubscriptionStatus::Active);
    assert_eq!(renewal.subscription.renewal_attempts, 0);
}

/// Inline (payment-driven) and scheduled renewals share one code path, so
/// leftover pool tokens follow `burn_unused` identically in both.
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn inline_and_scheduled_renewals_apply_the_same_carry_over_policy(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = SubscriptionManager::new(pool.clone(), catalog());
    let ledger = Ledger::new(pool.clone());

    for tariff in ["keep_monthly", "burn_monthly"] {
        let inline_account = new_account(&pool, &format!("inline-{tariff}")).await;
        let scheduled_account = new_account(&pool, &format!("scheduled-{tariff}")).await;

        let inline = manager.activate(request(inline_account, tariff)).await.unwrap();
        let scheduled = manager
            .activate(request(scheduled_account, tariff))
            .await
            .unwrap();
        set_pool(&pool, inline.subscription.id, 40).await;
        set_pool(&pool, scheduled.subscription.id, 40).await;

        // Inline: the same tariff is bought again.
        let inline_renewal = manager.activate(request(inline_account, tariff)).await.unwrap();
        assert!(matches!(inline_renewal.kind, ActivationKind::Renewed));
        // Scheduled: the renewal job renews the subscription directly.
        let scheduled_renewal = manager.renew(scheduled.subscription.id, None).await.unwrap();

        let expected_transfer = if tariff == "keep_monthly" { 40 } else { 0 };
        assert_eq!(wallet(&pool, inline_account).await, expected_transfer);
        assert_eq!(wallet(&pool, scheduled_account).await, expected_transfer);
        assert_eq!(scheduled_renewal.transferred, expected_transfer);
        assert_eq!(
            inline_renewal.subscription.tokens_remaining,
            scheduled_renewal.subscription.tokens_remaining
        );
        assert_eq!(
            ledger
                .count_by_kind(inline_account, TransactionKind::SubscriptionTransfer)
                .await
                .unwrap(),
            ledger
                .count_by_kind(scheduled_account, TransactionKind::SubscriptionTransfer)
                .await
                .unwrap()
        );
    }
}
