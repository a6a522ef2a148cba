use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> accounts,ledger,subscriptions,payments,referrals,generations
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub external_id: String,
    pub balance: i64,
    pub registration_bonus_granted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    RegistrationBonus,
    GenerationCharge,
    Purchase,
    Refund,
    AdminAdjustment,
    ReferralBonus,
    SubscriptionTransfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::RegistrationBonus => "registration_bonus",
            TransactionKind::GenerationCharge => "generation_charge",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjustment => "admin_adjustment",
            TransactionKind::ReferralBonus => "referral_bonus",
            TransactionKind::SubscriptionTransfer => "subscription_transfer",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "registration_bonus" => Some(TransactionKind::RegistrationBonus),
            "generation_charge" => Some(TransactionKind::GenerationCharge),
            "purchase" => Some(TransactionKind::Purchase),
            "refund" => Some(TransactionKind::Refund),
            "admin_adjustment" => Some(TransactionKind::AdminAdjustment),
            "referral_bonus" => Some(TransactionKind::ReferralBonus),
            "subscription_transfer" => Some(TransactionKind::SubscriptionTransfer),
            _ => None,
        }
    }
}

/// One immutable ledger effect. `balance_after` is the account balance right after it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub account_id: i64,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub description: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Expired,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: i64,
    pub tariff_slug: String,
    pub provider: String,
    pub payment_method_ref: Option<String>,
    pub tokens_per_period: i64,
    pub tokens_remaining: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub auto_renewal: bool,
    pub cancel_at_period_end: bool,
    pub renewal_attempts: i32,
    pub last_renewal_attempt_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether the pool may be spent at `now`. Canceled and past-due
    /// subscriptions stay usable until their period ends.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status != SubscriptionStatus::Expired && now < self.period_end
    }

    pub fn usable_tokens(&self, now: DateTime<Utc>) -> i64 {
        if self.is_usable(now) {
            self.tokens_remaining
        } else {
            0
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "succeeded" => PaymentStatus::Succeeded,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            "canceled" => PaymentStatus::Canceled,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub account_id: i64,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub parent_payment_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub tariff_slug: String,
    pub tokens_amount: i64,
    pub status: PaymentStatus,
    pub is_recurring: bool,
    pub payment_method_ref: Option<String>,
    pub confirmation_url: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, FromRow, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub inviter_id: i64,
    pub invitee_id: i64,
    pub inviter_bonus: i64,
    pub invitee_bonus: i64,
    pub bonus_paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    pub fn is_pending(&self) -> bool {
        self.bonus_paid_at.is_none() && self.inviter_bonus > 0
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "completed" => GenerationStatus::Completed,
            "failed" => GenerationStatus::Failed,
            _ => GenerationStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub account_id: i64,
    pub generation_type: String,
    pub model_key: String,
    pub status: GenerationStatus,
    pub cost_estimate: Decimal,
    pub cost_actual: Option<Decimal>,
    pub tokens_charged: Option<i64>,
    pub transaction_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
pub(crate) struct TransactionRow {
    pub id: Uuid,
    pub account_id: i64,
    pub kind: String,
    pub amount: i64,
    pub balance_after: i64,
    pub description: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl From<TransactionRow> for LedgerTransaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            // Rows are only ever written through `TransactionKind::as_str`.
            kind: TransactionKind::from_str(&row.kind).unwrap_or(TransactionKind::AdminAdjustment),
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub account_id: i64,
    pub tariff_slug: String,
    pub provider: String,
    pub payment_method_ref: Option<String>,
    pub tokens_per_period: i64,
    pub tokens_remaining: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: String,
    pub auto_renewal: bool,
    pub cancel_at_period_end: bool,
    pub renewal_attempts: i32,
    pub last_renewal_attempt_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            tariff_slug: row.tariff_slug,
            provider: row.provider,
            payment_method_ref: row.payment_method_ref,
            tokens_per_period: row.tokens_per_period,
            tokens_remaining: row.tokens_remaining,
            period_start: row.period_start,
            period_end: row.period_end,
            status: SubscriptionStatus::from_str(&row.status),
            auto_renewal: row.auto_renewal,
            cancel_at_period_end: row.cancel_at_period_end,
            renewal_attempts: row.renewal_attempts,
            last_renewal_attempt_at: row.last_renewal_attempt_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct PaymentRow {
    pub id: Uuid,
    pub account_id: i64,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub parent_payment_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub tariff_slug: String,
    pub tokens_amount: i64,
    pub status: String,
    pub is_recurring: bool,
    pub payment_method_ref: Option<String>,
    pub confirmation_url: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            parent_payment_id: row.parent_payment_id,
            amount: row.amount,
            currency: row.currency,
            tariff_slug: row.tariff_slug,
            tokens_amount: row.tokens_amount,
            status: PaymentStatus::from_str(&row.status),
            is_recurring: row.is_recurring,
            payment_method_ref: row.payment_method_ref,
            confirmation_url: row.confirmation_url,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct GenerationRecordRow {
    pub id: Uuid,
    pub account_id: i64,
    pub generation_type: String,
    pub model_key: String,
    pub status: String,
    pub cost_estimate: Decimal,
    pub cost_actual: Option<Decimal>,
    pub tokens_charged: Option<i64>,
    pub transaction_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<GenerationRecordRow> for GenerationRecord {
    fn from(row: GenerationRecordRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            generation_type: row.generation_type,
            model_key: row.model_key,
            status: GenerationStatus::from_str(&row.status),
            cost_estimate: row.cost_estimate,
            cost_actual: row.cost_actual,
            tokens_charged: row.tokens_charged,
            transaction_id: row.transaction_id,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}
