//! stockroom library
//!
//! Exposes the single-flight TTL cache, the delivery-company API proxy and the
//! CLI parsing used by the `stockroom` binary.

pub mod cache;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod logging;
