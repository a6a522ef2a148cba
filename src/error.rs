use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::providers::ProviderError;
use crate::billing::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Billing(err) => billing_status(err),
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::AccountNotFound(_)
        | BillingError::SubscriptionNotFound(_)
        | BillingError::PaymentNotFound(_)
        | BillingError::ProviderNotConfigured(_) => StatusCode::NOT_FOUND,
        BillingError::UnknownModel(_)
        | BillingError::TariffNotFound(_)
        | BillingError::TariffMismatch { .. }
        | BillingError::ProviderMismatch { .. } => StatusCode::BAD_REQUEST,
        BillingError::Provider(
            ProviderError::InvalidPayload(_)
            | ProviderError::MissingField(_)
            | ProviderError::InvalidRequest(_),
        ) => StatusCode::BAD_REQUEST,
        BillingError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::GenerationFailed(_)
        | BillingError::DeliveryFailed(_)
        | BillingError::Provider(_) => StatusCode::BAD_GATEWAY,
        BillingError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::PermanentStorage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
