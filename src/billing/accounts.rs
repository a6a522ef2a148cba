use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use crate::config::BillingCatalog;

use super::error::{BillingError, BillingResult};
use super::ledger::{self, LedgerEntry};
use super::models::{Account, LedgerTransaction, TransactionKind};
use super::subscriptions::{SubscriptionInfo, SubscriptionManager};

/// What a user sees when asking for their balance.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceOverview {
    pub account_id: i64,
    pub billing_enabled: bool,
    pub balance: i64,
    pub subscription_tokens: i64,
    pub total_available: i64,
    pub subscription: Option<SubscriptionInfo>,
}

/// key: billing-accounts -> registration, bonus and balance views
#[derive(Clone)]
pub struct AccountService {
    pool: PgPool,
    catalog: Arc<BillingCatalog>,
    subscriptions: SubscriptionManager,
}

impl AccountService {
    pub fn new(pool: PgPool, catalog: Arc<BillingCatalog>) -> Self {
        let subscriptions = SubscriptionManager::new(pool.clone(), catalog.clone());
        Self {
            pool,
            catalog,
            subscriptions,
        }
    }

    /// Returns the account for `external_id` and whether this call created it.
    pub async fn register(&self, external_id: &str) -> BillingResult<(Account, bool)> {
        let created = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (external_id)
            VALUES ($1)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(account) = created {
            info!(account_id = account.id, external_id, "account registered");
            return Ok((account, true));
        }

        // Lost the insert race; the row exists now.
        let account = self
            .find_by_external_id(external_id)
            .await?
            .ok_or(BillingError::PermanentStorage(sqlx::Error::RowNotFound))?;
        Ok((account, false))
    }

    pub async fn get(&self, account_id: i64) -> BillingResult<Account> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    /// Credits the configured bonus once per account. `None` when billing is off,
    /// the bonus is zero, or the account already received it.
    pub async fn grant_registration_bonus(
        &self,
        account_id: i64,
    ) -> BillingResult<Option<LedgerTransaction>> {
        let amount = self.catalog.billing.registration_bonus;
        if !self.catalog.billing.enabled || amount <= 0 {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        let account = ledger::lock_account(&mut tx, account_id).await?;
        if account.registration_bonus_granted {
            return Ok(None);
        }

        sqlx::query(
            "UPDATE accounts SET registration_bonus_granted = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        let entry = LedgerEntry::new(account_id, TransactionKind::RegistrationBonus, amount)
            .describe("Registration bonus");
        let transaction = ledger::record_in(&mut tx, entry).await?;
        tx.commit().await?;

        info!(account_id, amount, "registration bonus granted");
        Ok(Some(transaction))
    }

    pub async fn balance_overview(&self, account_id: i64) -> BillingResult<BalanceOverview> {
        let account = self.get(account_id).await?;
        let subscription = self
            .subscriptions
            .subscription_info(account_id, Utc::now())
            .await?;
        let subscription_tokens = subscription.as_ref().map_or(0, |info| info.usable_tokens);

        Ok(BalanceOverview {
            account_id,
            billing_enabled: self.catalog.billing.enabled,
            balance: account.balance,
            subscription_tokens,
            total_available: account.balance.max(0) + subscription_tokens,
            subscription,
        })
    }

    /// Operator correction. May take the balance below zero.
    pub async fn adjust_balance(
        &self,
        account_id: i64,
        amount: i64,
        reason: &str,
    ) -> BillingResult<LedgerTransaction> {
        let entry = LedgerEntry::new(account_id, TransactionKind::AdminAdjustment, amount)
            .describe(reason)
            .with_metadata(json!({ "reason": reason }));
        let mut tx = self.pool.begin().await?;
        let transaction = ledger::record_in(&mut tx, entry).await?;
        tx.commit().await?;
        info!(account_id, amount, reason, "balance adjusted");
        Ok(transaction)
    }
}
