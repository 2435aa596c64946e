use axum::{routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeledger::config::Config;
use tradeledger::services::{
    spawn_monitor, ContractService, LedgerContext, LoanAccrualEngine, Monitor, OptionService,
    PriceFeed, QuoteCache, RobotService, SqliteStore, StoreNotifier,
};
use tradeledger::sources::{TwelveDataClient, TwelveDataWs};
use tradeledger::websocket::{self, ConnectionRegistry};
use tradeledger::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting TradeLedger on {}:{}", config.host, config.port);

    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(SqliteStore::new(&config.database_path)?);

    let (cache, subscriptions) = QuoteCache::new();
    let api_key = match config.twelve_data_api_key.clone() {
        Some(key) => key,
        None => {
            warn!("TWELVE_DATA_API_KEY not set; quote requests will fail");
            String::new()
        }
    };

    let stream = TwelveDataWs::new(api_key.clone(), config.twelve_data_ws_url.clone(), cache.clone());
    tokio::spawn(async move {
        if let Err(e) = stream.run(subscriptions).await {
            tracing::error!("Quote stream stopped: {}", e);
        }
    });

    let provider = Arc::new(TwelveDataClient::new(
        api_key,
        config.twelve_data_rest_url.clone(),
        config.quote_timeout,
    ));
    let prices = PriceFeed::new(cache, provider, config.quote_timeout);
    let notifier = Arc::new(StoreNotifier::new(store.clone()));
    let registry = ConnectionRegistry::new();
    let ctx = LedgerContext::new(store, prices, notifier, registry.clone());

    // Background monitors
    let monitors = &config.monitors;
    let contracts: Arc<dyn Monitor> = Arc::new(ContractService::new(ctx.clone()));
    spawn_monitor(contracts, monitors.contract_interval);

    let loans: Arc<dyn Monitor> = Arc::new(LoanAccrualEngine::new(
        ctx.clone(),
        monitors.loan_max_retries,
        monitors.loan_processing_delay,
    ));
    spawn_monitor(loans, monitors.loan_interval);

    let robots: Arc<dyn Monitor> = Arc::new(RobotService::new(ctx.clone()));
    spawn_monitor(robots, monitors.robot_interval);

    match monitors.option_sweep_interval {
        Some(interval) => {
            let options: Arc<dyn Monitor> = Arc::new(OptionService::new(ctx.clone()));
            spawn_monitor(options, interval);
        }
        None => info!("Option sweep disabled; expired trades resolve lazily"),
    }

    if config.admin_feed_token.is_none() {
        warn!("ADMIN_FEED_TOKEN not set; admin trade feed will reject every connection");
    }

    let state = AppState {
        config: config.clone(),
        registry,
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws/admin/trades", get(websocket::admin_feed_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("TradeLedger listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
