//! Core domain types and pure logic for contact synchronization.
//!
//! This crate holds everything that does not need an HTTP client or a
//! database connection: the data model, normalisation rules, candidate
//! matching, field merging, the plan/apply sync engine, configuration, and
//! the shared error taxonomy used across the workspace.

pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod merger;
pub mod normalize;
pub mod ports;
pub mod types;
