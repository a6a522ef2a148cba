use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use token_billing::billing::{
    self, BillingContext, CheckoutProvider, ProviderRegistry, StarsProvider,
};
use token_billing::config::{self, BillingCatalog};
use token_billing::routes::api_routes;

async fn root() -> &'static str {
    "Token Billing API"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let catalog_path = config::BILLING_CATALOG_PATH.as_str();
    let catalog = Arc::new(
        BillingCatalog::load(catalog_path)
            .with_context(|| format!("loading billing catalog from {catalog_path}"))?,
    );
    tracing::info!(
        path = catalog_path,
        billing_enabled = catalog.billing.enabled,
        models = catalog.models.len(),
        tariffs = catalog.tariffs.len(),
        "billing catalog loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("connecting to postgres")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("running migrations");
        }
    }

    let providers: ProviderRegistry = ProviderRegistry::new()
        .with(billing::providers::STARS_PROVIDER, Arc::new(StarsProvider))
        .with(
            billing::providers::CHECKOUT_PROVIDER,
            Arc::new(CheckoutProvider::new(config::PAYMENT_RETURN_BASE_URL.as_str())),
        );
    tracing::info!(
        providers = ?providers.names().collect::<Vec<_>>(),
        "payment providers registered"
    );
    let ctx = BillingContext::new(pool.clone(), catalog, Arc::new(providers));
    billing::spawn_billing_scheduler(ctx.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(ctx));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
