//! # ads-connect
//!
//! Credential lifecycle and multi-source account sync for Amazon Ads:
//! encrypted token storage with proactive refresh, a shared rate-limited
//! executor for upstream calls, per-category account sources, and a sync
//! orchestrator that maintains the cross-category relationship graph.

pub mod adapters;
pub mod ads_api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod repositories;
pub mod server;
pub mod sync_orchestrator;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
