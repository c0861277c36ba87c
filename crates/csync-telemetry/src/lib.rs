//! Ambient logging setup for the contact-sync services.
//!
//! One piece of the observability stack: `tracing_subscriber`-based init for
//! human-readable (dev) and JSON (production) output, selected by
//! `RUST_LOG`/the caller's default level.

pub mod logging;
