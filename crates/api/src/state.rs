//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::ApiConfig;
use crate::db::Stores;
use crate::gateway::{PaymentGateway, ReturnUrls};
use crate::services::lifecycle::CheckoutSettings;
use crate::services::{Notifier, OrderCoordinator};

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`. The stores and the gateway are trait objects
/// so tests can swap in the in-memory store and a scripted gateway.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ApiConfig,
    stores: Stores,
    notifier: Arc<Notifier>,
    coordinator: OrderCoordinator,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Arguments
    ///
    /// * `config` - API configuration
    /// * `stores` - Persistence backends
    /// * `gateway` - Payment gateway adapter
    #[must_use]
    pub fn new(config: ApiConfig, stores: Stores, gateway: Arc<dyn PaymentGateway>) -> Self {
        let notifier = Arc::new(Notifier::new());
        let settings = CheckoutSettings {
            currency: config.base_currency,
            return_urls: ReturnUrls {
                return_url: config.payment_return_url(),
                cancel_url: config.payment_cancel_url(),
            },
        };
        let coordinator =
            OrderCoordinator::new(stores.clone(), gateway, notifier.clone(), settings);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                stores,
                notifier,
                coordinator,
            }),
        }
    }

    /// Get a reference to the API configuration.
    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    /// Get a reference to the persistence backends.
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    /// Get a reference to the live connection registry.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Get a reference to the order lifecycle coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &OrderCoordinator {
        &self.inner.coordinator
    }
}
