//! Naked Pineapple Sync library.
//!
//! Moves Shopify records into relational tables according to stored
//! mapping configurations. Full syncs go through Shopify bulk operations,
//! incremental syncs page through `updated_at` windows, and webhooks apply
//! single-record changes in near real time.
//!
//! # Security
//!
//! This crate holds a Shopify Admin API token and write access to the
//! target database. Only deploy on Tailscale-protected infrastructure.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod expression;
pub mod filter;
pub mod hooks;
pub mod memory;
pub mod orchestrator;
pub mod record;
pub mod routes;
pub mod scheduler;
pub mod service;
pub mod shopify;
pub mod state;
pub mod store;
pub mod transform;
pub mod webhook;
