//! Mercato API - order, payment and live notification backend.
//!
//! # Architecture
//!
//! - Axum REST API plus a WebSocket endpoint for live order events
//! - `PostgreSQL` via sqlx (or the in-process store with `memory://`)
//! - PayPal Orders v2 as the payment gateway (sandbox or live)
//!
//! Migrations are NOT run on startup. Run them explicitly with
//! `mercato migrate`.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use mercato_api::config::{ApiConfig, LogFormat};
use mercato_api::db::{self, MemoryStore, PgStore, Stores};
use mercato_api::gateway::PayPalGateway;
use mercato_api::state::AppState;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &ApiConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init)
    let config = ApiConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mercato_api=info,tower_http=debug".into());

    let use_json = config.log_format == LogFormat::Json;
    let json_layer = use_json.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (!use_json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let stores = if config.uses_memory_store() {
        tracing::warn!("Using in-memory store; data is lost on restart");
        Stores::from_backend(Arc::new(MemoryStore::new()))
    } else {
        let pool = db::create_pool(&config.database_url)
            .await
            .expect("Failed to create database pool");
        tracing::info!("Database pool created");
        Stores::from_backend(Arc::new(PgStore::new(pool)))
    };

    let gateway = PayPalGateway::new(&config.gateway).expect("Failed to create gateway client");
    tracing::info!(mode = ?config.gateway.mode, currency = %config.base_currency, "Payment gateway configured");
    if config.gateway.webhook_secret.is_none() {
        tracing::warn!("GATEWAY_WEBHOOK_SECRET is not set; all webhooks will be rejected");
    }

    let state = AppState::new(config.clone(), stores, Arc::new(gateway));

    let app = mercato_api::app(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    let addr = config.socket_addr();
    tracing::info!("mercato-api listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
