use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::models::{Account, LedgerTransaction, TransactionKind, TransactionRow};

const MAX_HISTORY_PAGE: i64 = 500;

/// History window actually served: `limit` in `1..=500`, `offset` never negative.
pub fn page_bounds(limit: i64, offset: i64) -> (i64, i64) {
    (limit.clamp(1, MAX_HISTORY_PAGE), offset.max(0))
}

/// A ledger effect waiting to be written.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: i64,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: Option<String>,
    pub metadata: Value,
}

impl LedgerEntry {
    pub fn new(account_id: i64, kind: TransactionKind, amount: i64) -> Self {
        Self {
            account_id,
            kind,
            amount,
            description: None,
            metadata: json!({}),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Stored balance compared against what the transaction log says it should be.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub account_id: i64,
    pub stored_balance: i64,
    pub latest_balance_after: Option<i64>,
    pub sum_of_amounts: i64,
    pub transaction_count: i64,
    pub consistent: bool,
}

/// key: billing-ledger -> append-only log backing the account balance
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Writes one entry and the matching balance update in a single database transaction.
    ///
    /// Negative amounts are accepted even when they overdraw the account; callers
    /// that must not overdraw check the balance first.
    pub async fn record(&self, entry: LedgerEntry) -> BillingResult<LedgerTransaction> {
        let mut tx = self.pool.begin().await?;
        let transaction = record_in(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(transaction)
    }

    /// Newest first.
    pub async fn history(
        &self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<LedgerTransaction>> {
        let (limit, offset) = page_bounds(limit, offset);
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, kind, amount, balance_after, description, metadata, created_at
            FROM transactions
            WHERE account_id = $1
            ORDER BY seq DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LedgerTransaction::from).collect())
    }

    pub async fn count_total(&self, account_id: i64) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_kind(&self, account_id: i64, kind: TransactionKind) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE account_id = $1 AND kind = $2",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn latest(&self, account_id: i64) -> BillingResult<Option<LedgerTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, kind, amount, balance_after, description, metadata, created_at
            FROM transactions
            WHERE account_id = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LedgerTransaction::from))
    }

    /// Drift check for an external reconciliation job.
    pub async fn reconcile(&self, account_id: i64) -> BillingResult<BalanceReport> {
        let stored_balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        let stored_balance = stored_balance.ok_or(BillingError::AccountNotFound(account_id))?;

        let (sum_of_amounts, transaction_count): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT, COUNT(*) FROM transactions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        let latest_balance_after = self.latest(account_id).await?.map(|tx| tx.balance_after);
        let consistent = sum_of_amounts == stored_balance
            && latest_balance_after.unwrap_or(0) == stored_balance;
        if !consistent {
            warn!(
                account_id,
                stored_balance,
                sum_of_amounts,
                ?latest_balance_after,
                "ledger drift detected"
            );
        }

        Ok(BalanceReport {
            account_id,
            stored_balance,
            latest_balance_after,
            sum_of_amounts,
            transaction_count,
            consistent,
        })
    }
}

/// Locks the account row for the rest of `tx`.
pub(crate) async fn lock_account(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
) -> BillingResult<Account> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BillingError::AccountNotFound(account_id))
}

/// Appends `entry` and moves the balance inside the caller's transaction.
pub(crate) async fn record_in(
    tx: &mut Transaction<'_, Postgres>,
    entry: LedgerEntry,
) -> BillingResult<LedgerTransaction> {
    let account = lock_account(tx, entry.account_id).await?;
    let balance_after = account.balance + entry.amount;

    let row = sqlx::query_as::<_, TransactionRow>(
        r#"
        INSERT INTO transactions (id, account_id, kind, amount, balance_after, description, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, account_id, kind, amount, balance_after, description, metadata, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.account_id)
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(balance_after)
    .bind(entry.description.as_deref())
    .bind(&entry.metadata)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE accounts SET balance = $2, updated_at = NOW() WHERE id = $1")
        .bind(entry.account_id)
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

    debug!(
        account_id = entry.account_id,
        kind = entry.kind.as_str(),
        amount = entry.amount,
        balance_after,
        "ledger entry recorded"
    );

    Ok(row.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_window_is_clamped() {
        assert_eq!(page_bounds(20, 40), (20, 40));
        assert_eq!(page_bounds(0, -3), (1, 0));
        assert_eq!(page_bounds(10_000, 0), (500, 0));
    }
}
