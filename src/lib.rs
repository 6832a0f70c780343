//! Compliance Sync Server Library
//!
//! Offline-first sync backend for the compliance document management
//! platform. Clients push local changes and pull server changes for events,
//! tasks, and documents; concurrent edits are detected by version and queued
//! for explicit resolution.
//!
//! # Modules
//!
//! - `sync`: push/pull/resolve/batch engine
//! - `db`: connection pool, schema, and the versioned entity store
//! - `routes`: HTTP surface under `/api/v1/sync`

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
