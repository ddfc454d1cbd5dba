//! Mirrorgate - A shadowing reverse proxy
//!
//! This library provides a reverse proxy that:
//! - Forwards every request to a single primary backend and returns its response
//! - Copies each request to a mirror backend on a detached task, discarding the result
//! - Optionally resolves the primary host to a container address found through
//!   the Docker API, kept current by a debounced event listener
//! - Uses connection pooling for efficient primary backend communication

pub mod cache;
pub mod config;
pub mod docker;
pub mod error;
pub mod mirror;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod runtime;
pub mod target;
