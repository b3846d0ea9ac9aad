//! Business services: the order lifecycle coordinator and the side-effect
//! sinks it drives.

pub mod analytics;
pub mod lifecycle;
pub mod notify;

pub use analytics::AnalyticsTracker;
pub use lifecycle::{LifecycleError, OrderCoordinator};
pub use notify::Notifier;
