use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::registry::Registry;

use super::error::{BillingError, BillingResult};
use super::models::{GenerationRecord, GenerationRecordRow};
use super::pricing::Usage;

/// Pending records older than this no longer count against the parallelism limit.
const STALE_PENDING_MINUTES: i32 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub content: String,
    pub usage: Option<Usage>,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("generation timed out")]
    Timeout,
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// key: generation-capability -> external model call, never retried by billing
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        params: &Value,
    ) -> Result<GenerationOutput, GenerationError>;
}

pub type GenerationRegistry = Registry<dyn GenerationProvider>;

/// key: generation-log -> one record per attempt, finalized once
#[derive(Clone)]
pub struct GenerationLog {
    pool: PgPool,
}

impl GenerationLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        account_id: i64,
        generation_type: &str,
        model_key: &str,
        cost_estimate: Decimal,
    ) -> BillingResult<GenerationRecord> {
        let row = sqlx::query_as::<_, GenerationRecordRow>(
            r#"
            INSERT INTO generation_records (id, account_id, generation_type, model_key, status, cost_estimate)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(generation_type)
        .bind(model_key)
        .bind(cost_estimate)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn get(&self, record_id: Uuid) -> BillingResult<Option<GenerationRecord>> {
        let row = sqlx::query_as::<_, GenerationRecordRow>(
            "SELECT * FROM generation_records WHERE id = $1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GenerationRecord::from))
    }

    /// No-op for records that were already finalized.
    pub async fn fail(&self, record_id: Uuid, error: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_records
            SET status = 'failed', error = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(record_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(record = %record_id, "generation record already finalized");
        }
        Ok(())
    }

    pub(crate) async fn complete_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
        tokens_charged: i64,
        transaction_id: Option<Uuid>,
        cost_actual: Option<Decimal>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_records
            SET status = 'completed',
                tokens_charged = $2,
                transaction_id = $3,
                cost_actual = $4,
                completed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(record_id)
        .bind(tokens_charged)
        .bind(transaction_id)
        .bind(cost_actual)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // Finalizing twice would attach a second charge to one attempt.
            return Err(BillingError::GenerationFailed(format!(
                "generation record {record_id} is not pending"
            )));
        }
        Ok(())
    }

    pub async fn last_started_at(
        &self,
        account_id: i64,
        generation_type: &str,
    ) -> BillingResult<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM generation_records
            WHERE account_id = $1 AND generation_type = $2
            "#,
        )
        .bind(account_id)
        .bind(generation_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    pub async fn pending_count(&self, account_id: i64) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM generation_records
            WHERE account_id = $1
              AND status = 'pending'
              AND created_at > NOW() - make_interval(mins => $2)
            "#,
        )
        .bind(account_id)
        .bind(STALE_PENDING_MINUTES)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
