use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/webhooks/:provider", post(api::handle_webhook))
        .route("/tariffs", get(api::list_tariffs))
        .route("/accounts", post(api::register_account))
        .route("/accounts/:id/balance", get(api::get_balance))
        .route("/accounts/:id/transactions", get(api::list_transactions))
        .route("/accounts/:id/payments", post(api::create_payment))
        .route(
            "/accounts/:id/subscription/cancel",
            post(api::cancel_subscription),
        )
        .route("/accounts/:id/referrals", get(api::referral_stats))
        .route(
            "/accounts/:id/generations/quote",
            post(api::quote_generation),
        )
}
