use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use token_billing::billing::{BillingContext, ProviderRegistry, StarsProvider};
use token_billing::billing::providers::STARS_PROVIDER;
use token_billing::config::BillingCatalog;
use token_billing::routes::api_routes;
use tower::ServiceExt;

const CATALOG: &str = r#"
billing:
  enabled: true
tariffs:
  tokens_100:
    kind: one_time
    name: 100 tokens
    tokens: 100
    prices:
      telegram_stars: { amount: 50, currency: XTR }
  retired:
    kind: one_time
    name: Retired pack
    tokens: 10
    enabled: false
"#;

/// Router over a pool that never connects; only routes that stay off the
/// database are exercised here.
fn app() -> Router {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://billing@localhost/unused")
        .unwrap();
    let catalog = Arc::new(BillingCatalog::from_yaml_str(CATALOG).unwrap());
    let providers = ProviderRegistry::new().with(STARS_PROVIDER, Arc::new(StarsProvider));
    let ctx = BillingContext::new(pool, catalog, Arc::new(providers));

    api_routes().layer(Extension(ctx))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// The recorder is process-global, so only this test installs it.
#[tokio::test]
async fn metrics_returns_ok() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(app())
        .layer(layer);
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tariffs_lists_enabled_entries_only() {
    let response = app()
        .oneshot(Request::builder().uri("/tariffs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let slugs: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|tariff| tariff["slug"].as_str().unwrap())
        .collect();
    assert_eq!(slugs, vec!["tokens_100"]);
}

#[tokio::test]
async fn webhook_for_unconfigured_provider_is_not_found() {
    let response = app()
        .oneshot(post_json("/webhooks/paypal", json!({ "event": "payment.succeeded" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("paypal"));
}

#[tokio::test]
async fn malformed_webhook_is_rejected_before_storage() {
    let response = app()
        .oneshot(post_json(
            &format!("/webhooks/{STARS_PROVIDER}"),
            json!({ "unexpected": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn quote_requires_positive_quantity() {
    let response = app()
        .oneshot(post_json(
            "/accounts/1/generations/quote",
            json!({ "model": "gpt-4o-mini", "quantity": "0" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
