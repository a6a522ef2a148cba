use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

use crate::config::BillingCatalog;

pub mod accounts;
pub mod api;
pub mod engine;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod models;
pub mod payments;
pub mod pricing;
pub mod providers;
pub mod referrals;
pub mod scheduler;
pub mod subscriptions;

pub use accounts::{AccountService, BalanceOverview};
pub use engine::{BillingEngine, GenerationCost, GenerationGate, GenerationRun, Reservation};
pub use error::{BillingError, BillingResult};
pub use ledger::{Ledger, LedgerEntry};
pub use models::{
    Account, LedgerTransaction, Payment, PaymentStatus, Referral, Subscription,
    SubscriptionStatus, TransactionKind,
};
pub use payments::{PaymentReconciler, WebhookOutcome};
pub use providers::{CheckoutProvider, PaymentProvider, ProviderRegistry, StarsProvider};
pub use referrals::ReferralLedger;
pub use scheduler::{
    process_tick as run_billing_automation_tick, spawn as spawn_billing_scheduler,
    SchedulerSettings, TickReport,
};
pub use subscriptions::SubscriptionManager;

use referrals::ReferralOutcome;

/// Result of first contact, or of a retry of it.
#[derive(Debug, Clone, Serialize)]
pub struct Onboarding {
    pub account: Account,
    pub created: bool,
    pub registration_bonus: Option<LedgerTransaction>,
    pub referral: Option<ReferralOutcome>,
}

/// key: billing-context -> every billing component wired over one pool and catalog
#[derive(Clone)]
pub struct BillingContext {
    pub catalog: Arc<BillingCatalog>,
    pub providers: Arc<ProviderRegistry>,
    pub ledger: Ledger,
    pub accounts: AccountService,
    pub engine: BillingEngine,
    pub subscriptions: SubscriptionManager,
    pub payments: PaymentReconciler,
    pub referrals: ReferralLedger,
}

impl BillingContext {
    pub fn new(pool: PgPool, catalog: Arc<BillingCatalog>, providers: Arc<ProviderRegistry>) -> Self {
        let subscriptions = SubscriptionManager::new(pool.clone(), catalog.clone());
        let referrals = ReferralLedger::new(pool.clone(), catalog.clone());
        let payments = PaymentReconciler::new(
            pool.clone(),
            catalog.clone(),
            providers.clone(),
            subscriptions.clone(),
            referrals.clone(),
        );
        Self {
            ledger: Ledger::new(pool.clone()),
            accounts: AccountService::new(pool.clone(), catalog.clone()),
            engine: BillingEngine::new(pool, catalog.clone()),
            subscriptions,
            payments,
            referrals,
            catalog,
            providers,
        }
    }

    /// Creates the account if needed, then finishes onboarding. Safe to retry:
    /// the referral is resolved only while `registration_bonus_granted` is
    /// unset, and resolving twice yields `AlreadyReferred`.
    pub async fn onboard(
        &self,
        external_id: &str,
        reference: Option<&str>,
    ) -> BillingResult<Onboarding> {
        let (account, created) = self.accounts.register(external_id).await?;
        let onboarding_pending = created || !account.registration_bonus_granted;

        // Referral first: the bonus flag marks onboarding as finished.
        let referral = match reference {
            Some(reference) if onboarding_pending => {
                Some(self.referrals.resolve(account.id, reference).await?)
            }
            _ => None,
        };
        let registration_bonus = self.accounts.grant_registration_bonus(account.id).await?;
        if !created && onboarding_pending {
            info!(account_id = account.id, "onboarding resumed for existing account");
        }

        let account = self.accounts.get(account.id).await?;
        Ok(Onboarding {
            account,
            created,
            registration_bonus,
            referral,
        })
    }
}
