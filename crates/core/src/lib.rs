//! Naked Pineapple Core - Shared types for the sync service.
//!
//! This crate provides the data model used across the sync components:
//! - `sync` - Shopify to database synchronization service
//! - `cli` - Command-line tools for migrations and one-off syncs
//!
//! # Architecture
//!
//! The core crate contains only types and traits - no I/O, no database access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Mapping configuration, schedules, statuses, history records,
//!   and type-safe IDs

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
