//! HTTP client for the delivery-company REST API

use reqwest::header::ACCEPT;
use reqwest::{Client, Request};
use serde_json::Value;
use tracing::{info, warn};

use super::{reshape, DeliveryError, DeliveryMethod, DeliveryRequest};
use crate::config::DeliveryConfig;

/// Client that forwards proxied calls to the delivery API
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL for the API (allows override for testing)
    base_url: String,
    /// Bearer token for the API
    token: Option<String>,
}

impl DeliveryClient {
    /// Creates a client from configuration
    pub fn new(config: DeliveryConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// Creates a client that reuses an existing HTTP client
    pub fn with_client(http_client: Client, config: DeliveryConfig) -> Self {
        Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        }
    }

    /// Builds the outgoing HTTP request without sending it
    ///
    /// The token goes in a bearer `Authorization` header, query parameters are
    /// appended to the URL, and for anything but GET the payload is sent as a
    /// form-encoded body.
    pub fn build_request(&self, request: &DeliveryRequest) -> Result<Request, DeliveryError> {
        let endpoint = validate_endpoint(&request.endpoint)?;
        let token = self.token.as_deref().ok_or(DeliveryError::MissingToken)?;

        let url = format!("{}/{}/", self.base_url, endpoint);
        let mut builder = self
            .http_client
            .request(request.method.to_reqwest(), url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if request.method != DeliveryMethod::Get {
            builder = builder.form(&request.payload);
        }

        Ok(builder.build()?)
    }

    /// Sends a proxied call and returns the reshaped JSON response
    ///
    /// # Returns
    /// * `Ok(Value)` - Response body with renamed fields
    /// * `Err(DeliveryError)` - If the request fails or the API returns a non-success status
    pub async fn call(&self, request: &DeliveryRequest) -> Result<Value, DeliveryError> {
        let http_request = self.build_request(request)?;
        info!(endpoint = %request.endpoint, method = %request.method, "calling delivery API");

        let response = self.http_client.execute(http_request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(endpoint = %request.endpoint, status = status.as_u16(), "delivery API rejected call");
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.json::<Value>().await?;
        Ok(reshape(body))
    }
}

/// Returns the endpoint without surrounding slashes, rejecting anything that
/// is not a plain path
fn validate_endpoint(endpoint: &str) -> Result<&str, DeliveryError> {
    let trimmed = endpoint.trim_matches('/');
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'));

    if valid {
        Ok(trimmed)
    } else {
        Err(DeliveryError::InvalidEndpoint(endpoint.to_string()))
    }
}
