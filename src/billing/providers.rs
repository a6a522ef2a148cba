use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::Registry;

use super::models::PaymentStatus;

pub const STARS_PROVIDER: &str = "telegram_stars";
pub const CHECKOUT_PROVIDER: &str = "checkout";

const STARS_CURRENCY: &str = "XTR";
const STARS_SUBSCRIPTION_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error("webhook payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("invalid payment request: {0}")]
    InvalidRequest(String),
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
    #[error("payment declined: {0}")]
    Declined(String),
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub tariff_slug: String,
    pub recurring: bool,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    /// Known up front for some providers, only on the first webhook for others.
    pub provider_payment_id: Option<String>,
    pub confirmation_url: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringSignal {
    None,
    First,
    Renewal,
}

/// Webhook normalized to what the reconciler needs.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEvent {
    pub external_id: String,
    pub status: PaymentStatus,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub metadata: Value,
    pub payment_method_ref: Option<String>,
    pub recurring: RecurringSignal,
}

impl ProviderEvent {
    /// Internal payment id the intent embedded in the provider-side metadata.
    pub fn internal_payment_id(&self) -> Option<Uuid> {
        self.metadata
            .get("payment_id")
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok())
    }
}

#[derive(Debug, Clone)]
pub struct SavedMethodCharge {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method_ref: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub provider_payment_id: String,
    pub status: PaymentStatus,
}

/// key: payment-provider -> pluggable gateway capability
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentIntent, ProviderError>;

    async fn process_webhook(&self, raw: &Value) -> Result<ProviderEvent, ProviderError>;

    /// Providers that push renewals themselves are skipped by the renewal scheduler.
    fn manages_renewals(&self) -> bool {
        false
    }

    async fn charge_saved_method(
        &self,
        _charge: &SavedMethodCharge,
    ) -> Result<ChargeReceipt, ProviderError> {
        Err(ProviderError::Unsupported("charging a saved payment method"))
    }
}

pub type ProviderRegistry = Registry<dyn PaymentProvider>;

/// key: payment-provider-stars -> in-app currency invoices with native recurring
pub struct StarsProvider;

#[async_trait]
impl PaymentProvider for StarsProvider {
    fn name(&self) -> &str {
        STARS_PROVIDER
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentIntent, ProviderError> {
        if request.currency != STARS_CURRENCY {
            return Err(ProviderError::InvalidRequest(format!(
                "stars invoices are priced in {STARS_CURRENCY}, got {}",
                request.currency
            )));
        }
        if !request.amount.fract().is_zero() || request.amount <= Decimal::ZERO {
            return Err(ProviderError::InvalidRequest(format!(
                "stars amount must be a positive whole number, got {}",
                request.amount
            )));
        }

        let invoice_payload = json!({
            "payment_id": request.payment_id,
            "tariff": request.tariff_slug,
        })
        .to_string();
        let mut payload = json!({
            "title": request.description,
            "currency": STARS_CURRENCY,
            "amount": request.amount.trunc().to_string(),
            "invoice_payload": invoice_payload,
        });
        if request.recurring {
            payload["subscription_period"] = json!(STARS_SUBSCRIPTION_PERIOD_SECS);
        }

        Ok(PaymentIntent {
            provider_payment_id: None,
            confirmation_url: None,
            payload,
        })
    }

    async fn process_webhook(&self, raw: &Value) -> Result<ProviderEvent, ProviderError> {
        let external_id = raw
            .get("telegram_payment_charge_id")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or(ProviderError::MissingField("telegram_payment_charge_id"))?;

        let metadata = match raw.get("invoice_payload") {
            Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded)
                .map_err(|err| ProviderError::InvalidPayload(format!("invoice_payload: {err}")))?,
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };

        let amount = raw
            .get("total_amount")
            .and_then(Value::as_i64)
            .map(Decimal::from);
        let currency = raw
            .get("currency")
            .and_then(Value::as_str)
            .map(str::to_string);

        let is_recurring = raw
            .get("is_recurring")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let is_first = raw
            .get("is_first_recurring")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let recurring = match (is_recurring, is_first) {
            (false, _) => RecurringSignal::None,
            (true, true) => RecurringSignal::First,
            (true, false) => RecurringSignal::Renewal,
        };

        Ok(ProviderEvent {
            external_id: external_id.to_string(),
            // Stars only reports completed payments.
            status: PaymentStatus::Succeeded,
            amount,
            currency,
            metadata,
            payment_method_ref: None,
            recurring,
        })
    }

    fn manages_renewals(&self) -> bool {
        true
    }
}

/// key: payment-provider-checkout -> hosted redirect checkout
pub struct CheckoutProvider {
    return_base_url: String,
}

impl CheckoutProvider {
    pub fn new(return_base_url: impl Into<String>) -> Self {
        Self {
            return_base_url: return_base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentProvider for CheckoutProvider {
    fn name(&self) -> &str {
        CHECKOUT_PROVIDER
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentIntent, ProviderError> {
        if request.amount <= Decimal::ZERO {
            return Err(ProviderError::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        let return_url = request
            .return_url
            .clone()
            .unwrap_or_else(|| format!("{}/return", self.return_base_url.trim_end_matches('/')));
        let confirmation_url = format!(
            "{}/pay/{}",
            self.return_base_url.trim_end_matches('/'),
            request.payment_id
        );

        Ok(PaymentIntent {
            provider_payment_id: None,
            confirmation_url: Some(confirmation_url),
            payload: json!({
                "amount": { "value": request.amount.to_string(), "currency": request.currency },
                "description": request.description,
                "save_payment_method": request.recurring,
                "return_url": return_url,
                "metadata": {
                    "payment_id": request.payment_id,
                    "tariff": request.tariff_slug,
                },
            }),
        })
    }

    async fn process_webhook(&self, raw: &Value) -> Result<ProviderEvent, ProviderError> {
        let event = raw
            .get("event")
            .and_then(Value::as_str)
            .ok_or(ProviderError::MissingField("event"))?;
        let object = raw
            .get("object")
            .filter(|value| value.is_object())
            .ok_or(ProviderError::MissingField("object"))?;

        let status = match event {
            "payment.succeeded" => PaymentStatus::Succeeded,
            "payment.canceled" => PaymentStatus::Canceled,
            "payment.failed" => PaymentStatus::Failed,
            "payment.waiting_for_capture" | "payment.pending" => PaymentStatus::Pending,
            "refund.succeeded" => PaymentStatus::Refunded,
            other => {
                return Err(ProviderError::InvalidPayload(format!(
                    "unknown event `{other}`"
                )))
            }
        };

        // Refund objects carry their own id; the payment they belong to is `payment_id`.
        let id_field = if status == PaymentStatus::Refunded {
            "payment_id"
        } else {
            "id"
        };
        let external_id = object
            .get(id_field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or(ProviderError::MissingField("object.id"))?;

        let amount_object = object.get("amount");
        let amount = amount_object
            .and_then(|amount| amount.get("value"))
            .and_then(|value| match value {
                Value::String(raw) => Decimal::from_str(raw).ok(),
                Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
                _ => None,
            });
        let currency = amount_object
            .and_then(|amount| amount.get("currency"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let payment_method_ref = object
            .get("payment_method")
            .filter(|method| {
                method
                    .get("saved")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .and_then(|method| method.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ProviderEvent {
            external_id: external_id.to_string(),
            status,
            amount,
            currency,
            metadata: object.get("metadata").cloned().unwrap_or_else(|| json!({})),
            payment_method_ref,
            // Renewals are merchant-initiated and reconciled by internal id.
            recurring: RecurringSignal::None,
        })
    }

    /// Submits a merchant-initiated charge. The gateway captures it
    /// asynchronously and confirms with a `payment.succeeded` webhook.
    async fn charge_saved_method(
        &self,
        charge: &SavedMethodCharge,
    ) -> Result<ChargeReceipt, ProviderError> {
        if charge.amount <= Decimal::ZERO {
            return Err(ProviderError::InvalidRequest(format!(
                "amount must be positive, got {}",
                charge.amount
            )));
        }
        if charge.payment_method_ref.trim().is_empty() {
            return Err(ProviderError::InvalidRequest(
                "saved payment method reference is empty".into(),
            ));
        }
        Ok(ChargeReceipt {
            provider_payment_id: checkout_charge_id(charge.payment_id),
            status: PaymentStatus::Pending,
        })
    }
}

/// Gateway id of a merchant-initiated charge; stable per internal payment so
/// a resubmitted charge maps to the same gateway payment.
pub fn checkout_charge_id(payment_id: Uuid) -> String {
    format!("co_{}", payment_id.simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(currency: &str, amount: &str, recurring: bool) -> PaymentRequest {
        PaymentRequest {
            payment_id: Uuid::new_v4(),
            amount: Decimal::from_str(amount).unwrap(),
            currency: currency.to_string(),
            description: "Pro".into(),
            tariff_slug: "pro_monthly".into(),
            recurring,
            return_url: None,
        }
    }

    #[tokio::test]
    async fn stars_invoice_embeds_internal_payment_id() {
        let request = request("XTR", "250", true);
        let intent = StarsProvider.create_payment(&request).await.unwrap();
        assert!(intent.provider_payment_id.is_none());
        assert_eq!(intent.payload["subscription_period"], json!(2_592_000));

        let encoded = intent.payload["invoice_payload"].as_str().unwrap();
        let decoded: Value = serde_json::from_str(encoded).unwrap();
        assert_eq!(decoded["payment_id"], json!(request.payment_id));
    }

    #[tokio::test]
    async fn stars_rejects_fractional_amounts() {
        let err = StarsProvider
            .create_payment(&request("XTR", "9.5", false))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn stars_webhook_distinguishes_first_charge_from_renewal() {
        let payment_id = Uuid::new_v4();
        let payload = json!({ "payment_id": payment_id }).to_string();

        let first = StarsProvider
            .process_webhook(&json!({
                "telegram_payment_charge_id": "charge-1",
                "invoice_payload": payload,
                "total_amount": 250,
                "currency": "XTR",
                "is_recurring": true,
                "is_first_recurring": true,
            }))
            .await
            .unwrap();
        assert_eq!(first.recurring, RecurringSignal::First);
        assert_eq!(first.internal_payment_id(), Some(payment_id));
        assert_eq!(first.amount, Some(Decimal::from(250)));

        let renewal = StarsProvider
            .process_webhook(&json!({
                "telegram_payment_charge_id": "charge-2",
                "invoice_payload": payload,
                "is_recurring": true,
                "is_first_recurring": false,
            }))
            .await
            .unwrap();
        assert_eq!(renewal.recurring, RecurringSignal::Renewal);
        assert_eq!(renewal.external_id, "charge-2");
        // Metadata repeats across renewals, so it still points at the first payment.
        assert_eq!(renewal.internal_payment_id(), Some(payment_id));
    }

    #[tokio::test]
    async fn stars_webhook_requires_charge_id() {
        let err = StarsProvider
            .process_webhook(&json!({ "invoice_payload": "{}" }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::MissingField("telegram_payment_charge_id")
        ));
    }

    #[tokio::test]
    async fn checkout_intent_points_at_hosted_page() {
        let provider = CheckoutProvider::new("https://pay.example.com/");
        let request = request("RUB", "499.00", true);
        let intent = provider.create_payment(&request).await.unwrap();
        assert_eq!(
            intent.confirmation_url.as_deref(),
            Some(format!("https://pay.example.com/pay/{}", request.payment_id).as_str())
        );
        assert_eq!(intent.payload["save_payment_method"], json!(true));
        assert_eq!(
            intent.payload["metadata"]["payment_id"],
            json!(request.payment_id)
        );
    }

    #[tokio::test]
    async fn checkout_webhook_normalizes_success_with_saved_method() {
        let payment_id = Uuid::new_v4();
        let event = CheckoutProvider::new("https://pay.example.com")
            .process_webhook(&json!({
                "event": "payment.succeeded",
                "object": {
                    "id": "co_123",
                    "status": "succeeded",
                    "amount": { "value": "499.00", "currency": "RUB" },
                    "metadata": { "payment_id": payment_id.to_string() },
                    "payment_method": { "id": "pm_77", "saved": true },
                }
            }))
            .await
            .unwrap();
        assert_eq!(event.external_id, "co_123");
        assert_eq!(event.status, PaymentStatus::Succeeded);
        assert_eq!(event.amount, Some(Decimal::from_str("499.00").unwrap()));
        assert_eq!(event.currency.as_deref(), Some("RUB"));
        assert_eq!(event.payment_method_ref.as_deref(), Some("pm_77"));
        assert_eq!(event.internal_payment_id(), Some(payment_id));
        assert_eq!(event.recurring, RecurringSignal::None);
    }

    #[tokio::test]
    async fn checkout_refund_is_keyed_by_original_payment() {
        let event = CheckoutProvider::new("https://pay.example.com")
            .process_webhook(&json!({
                "event": "refund.succeeded",
                "object": { "id": "rf_1", "payment_id": "co_123" }
            }))
            .await
            .unwrap();
        assert_eq!(event.status, PaymentStatus::Refunded);
        assert_eq!(event.external_id, "co_123");
        assert!(event.payment_method_ref.is_none());
    }

    #[tokio::test]
    async fn checkout_rejects_unknown_events() {
        let err = CheckoutProvider::new("https://pay.example.com")
            .process_webhook(&json!({ "event": "payout.succeeded", "object": {} }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn saved_method_charges_are_unsupported_by_default() {
        let err = StarsProvider
            .charge_saved_method(&SavedMethodCharge {
                payment_id: Uuid::new_v4(),
                amount: Decimal::from(250),
                currency: "XTR".into(),
                payment_method_ref: "pm".into(),
                description: "renewal".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[tokio::test]
    async fn checkout_charges_saved_method_pending_confirmation() {
        let provider = CheckoutProvider::new("https://pay.example.com");
        let mut charge = SavedMethodCharge {
            payment_id: Uuid::new_v4(),
            amount: Decimal::from_str("690.00").unwrap(),
            currency: "RUB".into(),
            payment_method_ref: "pm_ok".into(),
            description: "Pro renewal".into(),
        };

        let receipt = provider.charge_saved_method(&charge).await.unwrap();
        assert_eq!(receipt.status, PaymentStatus::Pending);
        assert_eq!(receipt.provider_payment_id, checkout_charge_id(charge.payment_id));

        charge.payment_method_ref = " ".into();
        let err = provider.charge_saved_method(&charge).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}
