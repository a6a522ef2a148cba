use thiserror::Error;
use uuid::Uuid;

use super::providers::ProviderError;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";
/// Unique index on `payments (provider, provider_payment_id)`.
pub(crate) const PAYMENT_EXTERNAL_ID_KEY: &str = "payments_provider_external_id_key";

/// key: billing-errors -> failure taxonomy shared by every billing component
///
/// Expected business outcomes (denials, cooldowns, duplicate webhooks) are not
/// represented here; they are returned as typed outcomes by the component that
/// detects them.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),
    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),
    #[error("model `{0}` is not configured")]
    UnknownModel(String),
    #[error("tariff `{0}` not found")]
    TariffNotFound(String),
    #[error("tariff `{tariff}` cannot be used here: {reason}")]
    TariffMismatch { tariff: String, reason: String },
    #[error("payment provider `{0}` is not configured")]
    ProviderNotConfigured(String),
    #[error("payment {payment_id} belongs to provider `{expected}`, event came from `{actual}`")]
    ProviderMismatch {
        payment_id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("result delivery failed: {0}")]
    DeliveryFailed(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("transient storage error: {0}")]
    TransientStorage(#[source] sqlx::Error),
    #[error("storage error: {0}")]
    PermanentStorage(#[source] sqlx::Error),
}

impl BillingError {
    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::TransientStorage(_))
    }

    /// A second payment row for the same provider id; any other unique
    /// violation is a real failure.
    pub fn is_duplicate_payment(&self) -> bool {
        match self {
            BillingError::PermanentStorage(sqlx::Error::Database(db)) => violates_unique(
                db.code().as_deref(),
                db.constraint(),
                PAYMENT_EXTERNAL_ID_KEY,
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            BillingError::TransientStorage(err)
        } else {
            BillingError::PermanentStorage(err)
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().map_or(false, |code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

pub(crate) fn is_transient_sqlstate(code: &str) -> bool {
    matches!(
        code,
        SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE
    )
}

pub(crate) fn violates_unique(code: Option<&str>, constraint: Option<&str>, name: &str) -> bool {
    code == Some(UNIQUE_VIOLATION) && constraint == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_sqlstates_are_transient() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("55P03"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }

    #[test]
    fn pool_timeout_is_retryable_and_missing_row_is_not() {
        let timeout = BillingError::from(sqlx::Error::PoolTimedOut);
        assert!(timeout.is_retryable());

        let missing = BillingError::from(sqlx::Error::RowNotFound);
        assert!(!missing.is_retryable());
        assert!(matches!(missing, BillingError::PermanentStorage(_)));
        assert!(!missing.is_duplicate_payment());
    }

    #[test]
    fn only_the_payment_id_index_counts_as_duplicate() {
        assert!(violates_unique(
            Some("23505"),
            Some(PAYMENT_EXTERNAL_ID_KEY),
            PAYMENT_EXTERNAL_ID_KEY
        ));
        assert!(!violates_unique(
            Some("23505"),
            Some("subscriptions_one_live_per_account"),
            PAYMENT_EXTERNAL_ID_KEY
        ));
        assert!(!violates_unique(Some("23505"), None, PAYMENT_EXTERNAL_ID_KEY));
        assert!(!violates_unique(
            Some("40001"),
            Some(PAYMENT_EXTERNAL_ID_KEY),
            PAYMENT_EXTERNAL_ID_KEY
        ));
    }

    #[test]
    fn business_errors_are_not_retryable() {
        let err = BillingError::InsufficientBalance {
            required: 15,
            available: 3,
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "insufficient balance: required 15, available 3"
        );
    }
}
