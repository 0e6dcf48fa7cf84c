//! Durable outbox for observations that could not be published
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Ordered, paged reads for draining
//! - Idempotent removal so a crash between publish and delete only causes redelivery

pub mod schema;
pub mod store;

pub use store::{Outbox, OutboxCursor};
