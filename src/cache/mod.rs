//! In-memory cache for backend reads
//!
//! This module provides `SmartCache`, a keyed async cache with a uniform TTL.
//! Concurrent requests for the same key collapse into a single producer call,
//! and expired entries stay readable through `peek` until a new fetch replaces
//! them.

mod smart;

pub use smart::{CachedData, KeyState, SmartCache};
