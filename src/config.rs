//! Runtime configuration for the cache and the delivery proxy
//!
//! Both structs carry sensible defaults; the CLI overrides them from flags or
//! environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Default time-to-live for cached reads (2 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_millis(120_000);

/// Default base URL of the delivery-company REST API
pub const DEFAULT_DELIVERY_URL: &str = "https://api.delivery.example/v1";

/// Configuration for a [`SmartCache`](crate::cache::SmartCache) instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a stored value counts as fresh
    pub ttl: Duration,
    /// Upper bound on stored entries; `None` keeps every key until invalidated
    pub max_entries: Option<NonZeroUsize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    /// Creates a config with the given TTL and no capacity bound
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Bounds the cache to `max_entries`, evicting least recently used keys
    pub fn max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

/// Configuration for the delivery-company API client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Base URL; endpoint names are appended as path segments
    pub base_url: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DELIVERY_URL.to_string(),
            token: None,
        }
    }
}
