//! Delivery client that serves reads through a shared cache

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{endpoint_prefix, DeliveryClient, DeliveryError, DeliveryRequest};
use crate::cache::SmartCache;

/// Cache type used for delivery API responses
pub type DeliveryCache = SmartCache<Value, DeliveryError>;

/// Routes GET calls through a [`SmartCache`] and invalidates an endpoint's
/// cached reads after a successful write to it
#[derive(Debug, Clone)]
pub struct CachedDeliveryClient {
    client: DeliveryClient,
    cache: DeliveryCache,
}

impl CachedDeliveryClient {
    /// Wraps `client`, storing reads in `cache`
    pub fn new(client: DeliveryClient, cache: DeliveryCache) -> Self {
        Self { client, cache }
    }

    /// The cache backing this client
    pub fn cache(&self) -> &DeliveryCache {
        &self.cache
    }

    /// Performs a proxied call
    ///
    /// # Behavior
    /// - GET: served from cache while fresh; concurrent identical reads share one API call
    /// - Other methods: always sent; on success every cached read of the endpoint is dropped
    pub async fn fetch(&self, request: DeliveryRequest) -> Result<Value, Arc<DeliveryError>> {
        if request.method.is_read() {
            let key = request.cache_key();
            let client = self.client.clone();
            return self
                .cache
                .get(&key, move || async move { client.call(&request).await })
                .await;
        }

        let value = self.client.call(&request).await.map_err(Arc::new)?;
        let prefix = endpoint_prefix(&request.endpoint);
        debug!(prefix = %prefix, method = %request.method, "write succeeded, dropping cached reads");
        self.cache.invalidate_prefix(&prefix);
        Ok(value)
    }

    /// Drops every cached response, e.g. when the session ends
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
