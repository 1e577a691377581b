//! Delivery-company API proxy
//!
//! Forwards named endpoint calls to the delivery company's REST API as
//! form-encoded requests and reshapes the JSON it returns. Read calls can be
//! routed through a [`SmartCache`](crate::cache::SmartCache) with
//! [`CachedDeliveryClient`].

pub mod cached;
pub mod client;

pub use cached::{CachedDeliveryClient, DeliveryCache};
pub use client::DeliveryClient;

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

/// Scratch URL used only to form-encode query parameters for cache keys
const QUERY_KEY_BASE: &str = "http://cache.key/";

/// Response fields renamed for callers, as `(api name, caller name)`
const RENAMED_FIELDS: [(&str, &str); 2] = [("data", "items"), ("total_data", "total")];

/// Errors that can occur when calling the delivery API
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed or could not be built
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("Delivery API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint name is empty or contains characters outside a path segment
    #[error("Invalid endpoint name: '{0}'")]
    InvalidEndpoint(String),

    /// No API token was configured
    #[error("No delivery API token configured")]
    MissingToken,
}

/// HTTP methods accepted by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl DeliveryMethod {
    /// Parses a method name, ignoring case
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the call only reads data and may be served from cache
    pub fn is_read(self) -> bool {
        self == Self::Get
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single proxied call: endpoint, method, form payload and query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    /// Endpoint name, appended to the base URL as a path
    pub endpoint: String,
    pub method: DeliveryMethod,
    /// Form fields sent as the request body (ignored for GET)
    pub payload: BTreeMap<String, String>,
    /// Query string parameters
    pub query: BTreeMap<String, String>,
}

impl DeliveryRequest {
    /// Creates a request with no payload or query parameters
    pub fn new(endpoint: impl Into<String>, method: DeliveryMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            payload: BTreeMap::new(),
            query: BTreeMap::new(),
        }
    }

    /// Shorthand for a GET request
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, DeliveryMethod::Get)
    }

    /// Adds a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Adds a form field to the payload
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Cache key covering every parameter that affects a read's result
    ///
    /// Query parameters are sorted and form-encoded as on the wire, so equal
    /// requests built in any order share a key.
    pub fn cache_key(&self) -> String {
        let query = Url::parse_with_params(QUERY_KEY_BASE, &self.query)
            .ok()
            .and_then(|url| url.query().map(str::to_string))
            .unwrap_or_default();
        format!("{}{}", endpoint_prefix(&self.endpoint), query)
    }
}

/// Prefix shared by every cache key of an endpoint
pub fn endpoint_prefix(endpoint: &str) -> String {
    format!("delivery:{}:", endpoint.trim_matches('/'))
}

/// Renames the API's response fields to the names callers expect
///
/// Only top-level fields of a JSON object are touched; any other shape is
/// returned as is.
pub fn reshape(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        for (from, to) in RENAMED_FIELDS {
            if let Some(field) = map.remove(from) {
                map.insert(to.to_string(), field);
            }
        }
    }
    value
}
