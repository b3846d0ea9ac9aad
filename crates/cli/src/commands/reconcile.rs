//! Payment reconciliation command.
//!
//! Asks the provider for the state of pending gateway orders and applies it
//! through the same coordinator the API uses, so side effects (cart clear,
//! analytics) happen exactly once even if a webhook raced the command.
//!
//! # Environment Variables
//!
//! The full API configuration (database and `GATEWAY_*` variables).

use std::sync::Arc;

use mercato_api::config::{ApiConfig, ConfigError};
use mercato_api::db::{PgStore, Stores, create_pool};
use mercato_api::gateway::{GatewayError, PayPalGateway};
use mercato_api::services::LifecycleError;
use mercato_api::services::lifecycle::Applied;
use mercato_api::state::AppState;
use thiserror::Error;

/// Errors that stop reconciliation as a whole.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Gateway client error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("{0} of {1} orders failed to reconcile")]
    Partial(usize, usize),
}

/// Reconcile one order, or up to `limit` pending ones.
pub async fn run(external_order_id: Option<&str>, limit: u32) -> Result<(), ReconcileError> {
    let config = ApiConfig::from_env()?;
    if config.uses_memory_store() {
        tracing::warn!("In-memory store selected; nothing to reconcile");
        return Ok(());
    }

    let pool = create_pool(&config.database_url).await?;
    let stores = Stores::from_backend(Arc::new(PgStore::new(pool)));
    let gateway = PayPalGateway::new(&config.gateway)?;
    let state = AppState::new(config, stores, Arc::new(gateway));
    let coordinator = state.coordinator();

    if let Some(external_order_id) = external_order_id {
        let applied = coordinator.reconcile(external_order_id).await?;
        report(external_order_id, &applied);
        return Ok(());
    }

    let results = coordinator.reconcile_pending(limit).await?;
    let total = results.len();
    let mut failed = 0;
    for (order_id, result) in results {
        match result {
            Ok(applied) => report(&order_id.to_string(), &applied),
            Err(e) => {
                failed += 1;
                tracing::warn!(%order_id, error = %e, "Reconciliation failed");
            }
        }
    }

    tracing::info!(total, failed, "Reconciliation finished");
    if failed > 0 {
        return Err(ReconcileError::Partial(failed, total));
    }
    Ok(())
}

fn report(reference: &str, applied: &Applied) {
    let order = applied.order();
    if applied.changed() {
        tracing::info!(
            reference,
            order_id = %order.id,
            payment_status = %order.payment_status,
            "Payment status updated from provider"
        );
    } else {
        tracing::info!(
            reference,
            order_id = %order.id,
            payment_status = %order.payment_status,
            "Already in sync"
        );
    }
}
