//! Mandelgate - an authenticating reverse proxy in front of one containerized backend
//!
//! This library provides:
//! - HS256 bearer token issuance (`POST /token`) and validation
//! - A streaming reverse proxy that hides the backend's address, including in
//!   the `Location` headers of its redirects
//! - Lifecycle management for the backend container: pull, start, readiness
//!   polling and teardown through the Docker Engine API
//! - Per-request access logging and graceful connection draining

pub mod access_log;
pub mod auth;
pub mod config;
pub mod docker;
pub mod duration;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod runtime;
pub mod server;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
