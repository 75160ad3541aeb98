//! `matsearch` crate (library surface).
//!
//! The primary entrypoint for end users is the `matsearch` binary (CLI + HTTP server).
//! This library exposes the HTTP layer so it can be embedded or driven in-process.

pub mod envelope;
pub mod server;

pub use matsearch_core as core;
pub use matsearch_local as local;
