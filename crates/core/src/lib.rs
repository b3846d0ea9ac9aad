//! Mercato Core - Shared domain types and order lifecycle rules.
//!
//! This crate provides the types used across all Mercato components:
//! - `api` - REST and WebSocket backend for the storefront and admin console
//! - `cli` - Command-line tools for migrations, sessions and reconciliation
//!
//! # Architecture
//!
//! The core crate contains only types and pure functions - no I/O, no database
//! access, no HTTP clients. The order lifecycle transition table lives here so
//! that every caller (store, coordinator, CLI) applies the same policy.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for IDs, money, emails and statuses
//! - [`order`] - Orders, line items, addresses and pricing
//! - [`lifecycle`] - Order and payment status transition table
//! - [`cart`] - Per-user shopping cart

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cart;
pub mod lifecycle;
pub mod order;
pub mod types;

pub use cart::Cart;
pub use lifecycle::{PaymentEvent, TransitionError};
pub use order::{
    LineItem, NewOrder, Order, OrderTotals, OrderValidationError, SHIPPING_FEE, ShippingAddress,
};
pub use types::*;
