use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::config::{BillingCatalog, ReferralProgram};

use super::error::BillingResult;
use super::ledger::{self, LedgerEntry};
use super::models::{Account, LedgerTransaction, Referral, TransactionKind};

const REFERENCE_PREFIX: &str = "ref_";

/// Extracts the inviter's external id from a `ref_<external_id>` start parameter.
pub fn parse_reference(raw: &str) -> Option<&str> {
    raw.trim()
        .strip_prefix(REFERENCE_PREFIX)
        .map(str::trim)
        .filter(|external_id| !external_id.is_empty())
}

/// Bonus actually payable given what the inviter already earned.
/// `max_earnings == 0` disables the cap.
pub fn cap_bonus(bonus: i64, already_earned: i64, max_earnings: i64) -> i64 {
    let bonus = bonus.max(0);
    if max_earnings == 0 {
        return bonus;
    }
    bonus.min((max_earnings - already_earned).max(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Disabled,
    InvalidReference,
    SelfReferral,
    InviterNotFound,
    AlreadyReferred,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReferralOutcome {
    Linked {
        referral: Referral,
        invitee_credit: Option<LedgerTransaction>,
        inviter_credit: Option<LedgerTransaction>,
        inviter_pending: bool,
    },
    Rejected {
        reason: RejectReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralStats {
    pub total_referrals: i64,
    pub total_earnings: i64,
    pub pending_bonuses: i64,
    pub max_earnings: i64,
    pub can_earn_more: bool,
}

/// key: referral-ledger -> capped bonuses at registration and first payment
#[derive(Clone)]
pub struct ReferralLedger {
    pool: PgPool,
    catalog: Arc<BillingCatalog>,
}

impl ReferralLedger {
    pub fn new(pool: PgPool, catalog: Arc<BillingCatalog>) -> Self {
        Self { pool, catalog }
    }

    fn program(&self) -> &ReferralProgram {
        &self.catalog.referral
    }

    /// Links `invitee_id` to the inviter named by `reference` and pays out.
    ///
    /// The invitee bonus is credited immediately. When the program requires a
    /// payment, the inviter's share stays pending until `pay_pending_bonus`.
    pub async fn resolve(&self, invitee_id: i64, reference: &str) -> BillingResult<ReferralOutcome> {
        let program = self.program();
        if !program.enabled {
            return Ok(rejected(RejectReason::Disabled));
        }
        let Some(inviter_external_id) = parse_reference(reference) else {
            return Ok(rejected(RejectReason::InvalidReference));
        };

        let inviter = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE external_id = $1")
            .bind(inviter_external_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(inviter) = inviter else {
            return Ok(rejected(RejectReason::InviterNotFound));
        };
        if inviter.id == invitee_id {
            return Ok(rejected(RejectReason::SelfReferral));
        }

        let mut tx = self.pool.begin().await?;
        // Lock in id order so two crossing registrations cannot deadlock.
        let (first, second) = if inviter.id < invitee_id {
            (inviter.id, invitee_id)
        } else {
            (invitee_id, inviter.id)
        };
        ledger::lock_account(&mut tx, first).await?;
        ledger::lock_account(&mut tx, second).await?;

        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM referrals WHERE invitee_id = $1")
                .bind(invitee_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Ok(rejected(RejectReason::AlreadyReferred));
        }

        let earned = earnings_in(&mut tx, inviter.id).await?;
        let inviter_bonus = cap_bonus(program.inviter_bonus, earned, program.max_earnings);
        let inviter_pending = program.require_payment && inviter_bonus > 0;
        let bonus_paid_at = if inviter_pending { None } else { Some(Utc::now()) };

        let referral = sqlx::query_as::<_, Referral>(
            r#"
            INSERT INTO referrals (id, inviter_id, invitee_id, inviter_bonus, invitee_bonus, bonus_paid_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(inviter.id)
        .bind(invitee_id)
        .bind(inviter_bonus)
        .bind(program.invitee_bonus)
        .bind(bonus_paid_at)
        .fetch_one(&mut *tx)
        .await?;

        let invitee_credit = if program.invitee_bonus > 0 {
            let entry = LedgerEntry::new(
                invitee_id,
                TransactionKind::ReferralBonus,
                program.invitee_bonus,
            )
            .describe("Referral welcome bonus")
            .with_metadata(json!({ "referral_id": referral.id, "role": "invitee" }));
            Some(ledger::record_in(&mut tx, entry).await?)
        } else {
            None
        };

        let inviter_credit = if !inviter_pending && inviter_bonus > 0 {
            Some(credit_inviter(&mut tx, &referral, inviter_bonus).await?)
        } else {
            None
        };

        tx.commit().await?;

        info!(
            inviter_id = inviter.id,
            invitee_id,
            inviter_bonus,
            invitee_bonus = program.invitee_bonus,
            inviter_pending,
            "referral linked"
        );

        Ok(ReferralOutcome::Linked {
            referral,
            invitee_credit,
            inviter_credit,
            inviter_pending,
        })
    }

    pub async fn pay_pending_bonus(&self, invitee_id: i64) -> BillingResult<Option<LedgerTransaction>> {
        let mut tx = self.pool.begin().await?;
        let paid = self.pay_pending_bonus_in(&mut tx, invitee_id).await?;
        tx.commit().await?;
        Ok(paid)
    }

    /// Releases the inviter's pending share, capped again against current earnings.
    /// Marks the referral paid even when the cap leaves nothing to credit.
    pub(crate) async fn pay_pending_bonus_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        invitee_id: i64,
    ) -> BillingResult<Option<LedgerTransaction>> {
        let pending = sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE invitee_id = $1 AND bonus_paid_at IS NULL FOR UPDATE",
        )
        .bind(invitee_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(referral) = pending else {
            return Ok(None);
        };

        ledger::lock_account(tx, referral.inviter_id).await?;
        let earned = earnings_in(tx, referral.inviter_id).await?;
        let amount = cap_bonus(referral.inviter_bonus, earned, self.program().max_earnings);

        sqlx::query("UPDATE referrals SET inviter_bonus = $2, bonus_paid_at = NOW() WHERE id = $1")
            .bind(referral.id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        let credit = if amount > 0 {
            Some(credit_inviter(tx, &referral, amount).await?)
        } else {
            None
        };

        info!(
            inviter_id = referral.inviter_id,
            invitee_id,
            amount,
            requested = referral.inviter_bonus,
            "pending referral bonus released"
        );
        Ok(credit)
    }

    pub async fn stats(&self, inviter_id: i64) -> BillingResult<ReferralStats> {
        let (total_referrals, total_earnings, pending_bonuses): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(inviter_bonus) FILTER (WHERE bonus_paid_at IS NOT NULL), 0)::BIGINT,
                COUNT(*) FILTER (WHERE bonus_paid_at IS NULL AND inviter_bonus > 0)
            FROM referrals
            WHERE inviter_id = $1
            "#,
        )
        .bind(inviter_id)
        .fetch_one(&self.pool)
        .await?;

        let max_earnings = self.program().max_earnings;
        Ok(ReferralStats {
            total_referrals,
            total_earnings,
            pending_bonuses,
            max_earnings,
            can_earn_more: max_earnings == 0 || total_earnings < max_earnings,
        })
    }
}

fn rejected(reason: RejectReason) -> ReferralOutcome {
    ReferralOutcome::Rejected { reason }
}

async fn earnings_in(tx: &mut Transaction<'_, Postgres>, inviter_id: i64) -> BillingResult<i64> {
    let earned: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(inviter_bonus), 0)::BIGINT FROM referrals
        WHERE inviter_id = $1 AND bonus_paid_at IS NOT NULL
        "#,
    )
    .bind(inviter_id)
    .fetch_one(&mut *tx)
    .await?;
    Ok(earned)
}

async fn credit_inviter(
    tx: &mut Transaction<'_, Postgres>,
    referral: &Referral,
    amount: i64,
) -> BillingResult<LedgerTransaction> {
    let entry = LedgerEntry::new(referral.inviter_id, TransactionKind::ReferralBonus, amount)
        .describe("Referral bonus")
        .with_metadata(json!({
            "referral_id": referral.id,
            "invitee_id": referral.invitee_id,
            "role": "inviter",
        }));
    ledger::record_in(tx, entry).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_payloads() {
        assert_eq!(parse_reference("ref_123456"), Some("123456"));
        assert_eq!(parse_reference("  ref_abc "), Some("abc"));
        assert_eq!(parse_reference("ref_"), None);
        assert_eq!(parse_reference("promo_123"), None);
        assert_eq!(parse_reference(""), None);
    }

    #[test]
    fn bonus_is_capped_by_remaining_allowance() {
        assert_eq!(cap_bonus(50, 0, 5000), 50);
        assert_eq!(cap_bonus(50, 4980, 5000), 20);
        assert_eq!(cap_bonus(50, 5000, 5000), 0);
        assert_eq!(cap_bonus(50, 6000, 5000), 0);
    }

    #[test]
    fn zero_cap_means_unlimited() {
        assert_eq!(cap_bonus(50, 1_000_000, 0), 50);
        assert_eq!(cap_bonus(-5, 0, 0), 0);
    }

    #[test]
    fn repeated_payouts_never_exceed_cap() {
        let max = 120;
        let mut earned = 0;
        for _ in 0..10 {
            earned += cap_bonus(50, earned, max);
        }
        assert_eq!(earned, max);
    }
}
