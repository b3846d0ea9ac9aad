//! HTTP middleware and extractors.
//!
//! # Middleware Order (bottom to top in Router)
//!
//! 1. Sentry layers (hub per request, capture errors)
//! 2. `TraceLayer` (request spans)
//! 3. Request ID (add unique ID to each request)
//! 4. CORS (allowed storefront and admin origins)
//!
//! Authentication is done per handler with the extractors in [`auth`].

pub mod auth;
pub mod request_id;

pub use auth::{Authenticated, Principal, RequireAdmin, RequireUser};
pub use request_id::request_id_middleware;
