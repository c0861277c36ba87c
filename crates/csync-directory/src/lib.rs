//! Rate-limited, circuit-breaker-protected HTTP client for the contacts
//! directory API.
//!
//! This crate provides the one piece of the sync pipeline that talks to the
//! outside world under quota: a sliding-window rate limiter, a circuit
//! breaker for sustained outages, and `DirectoryClient`, which implements
//! the `DirectoryLookup`/`DirectoryWriter` ports declared in `csync-core`.

pub mod circuit_breaker;
pub mod client;
pub mod rate_limiter;

pub use client::DirectoryClient;
