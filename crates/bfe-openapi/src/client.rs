use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{ApiError, ApiResponse, PoolResponse, UpsertParam};

/// Path prefix of every open-api route
pub const API_VERSION: &str = "/open-api/v1";

/// Thin client over the open-api
///
/// The token is sent verbatim in the `Authorization` header. Each request is
/// bounded by the timeout given at construction.
#[derive(Debug, Clone)]
pub struct OpenApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl OpenApiClient {
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] if the HTTP client cannot be built or the
    /// token contains characters that are not valid in a header.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        HeaderValue::from_str(token).map_err(|_| {
            ApiError::Config("API token contains invalid characters".to_string())
        })?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pools_path(product: &str) -> String {
        format!("{}/products/{}/instance-pools", API_VERSION, product)
    }

    pub fn pool_path(product: &str, pool: &str) -> String {
        format!("{}/{}", Self::pools_path(product), pool)
    }

    /// Send one request and unwrap the envelope
    ///
    /// A body that is not an envelope is folded into one carrying the HTTP
    /// status and the raw body text, so callers only ever look at
    /// [`ApiResponse::status`].
    #[instrument(skip(self, body), fields(method = %method))]
    pub async fn issue(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, &self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let http_status = response.status();
        let text = response.text().await?;

        let envelope = match serde_json::from_str::<ApiResponse>(&text) {
            Ok(envelope) => envelope,
            Err(_) => ApiResponse {
                status: http_status.as_u16(),
                message: text,
                data: Value::Null,
            },
        };

        debug!(
            http_status = http_status.as_u16(),
            status = envelope.status,
            "open-api request completed"
        );

        Ok(envelope)
    }

    pub async fn list_pools(&self, product: &str) -> Result<Vec<String>, ApiError> {
        self.issue(Method::GET, &Self::pools_path(product), None)
            .await?
            .into_data()
    }

    pub async fn get_pool(&self, product: &str, pool: &str) -> Result<PoolResponse, ApiError> {
        self.issue(Method::GET, &Self::pool_path(product, pool), None)
            .await?
            .into_data()
    }

    pub async fn create_pool(
        &self,
        product: &str,
        param: &UpsertParam,
    ) -> Result<PoolResponse, ApiError> {
        let body = serde_json::to_value(param)?;
        self.issue(Method::POST, &Self::pools_path(product), Some(&body))
            .await?
            .into_data()
    }

    pub async fn update_pool(
        &self,
        product: &str,
        param: &UpsertParam,
    ) -> Result<PoolResponse, ApiError> {
        let body = serde_json::to_value(param)?;
        self.issue(
            Method::PATCH,
            &Self::pool_path(product, &param.name),
            Some(&body),
        )
        .await?
        .into_data()
    }

    pub async fn delete_pool(&self, product: &str, pool: &str) -> Result<(), ApiError> {
        self.issue(Method::DELETE, &Self::pool_path(product, pool), None)
            .await?
            .into_result()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(
            OpenApiClient::pools_path("shop"),
            "/open-api/v1/products/shop/instance-pools"
        );
        assert_eq!(
            OpenApiClient::pool_path("shop", "shop.k8s_default_web_http"),
            "/open-api/v1/products/shop/instance-pools/shop.k8s_default_web_http"
        );
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let client =
            OpenApiClient::new("http://bfe-api:8183/", "token", Duration::from_secs(3)).unwrap();
        assert_eq!(client.base_url(), "http://bfe-api:8183");
    }

    #[test]
    fn test_new_rejects_invalid_token() {
        let err = OpenApiClient::new("http://bfe-api", "bad\ntoken", Duration::from_secs(3))
            .unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
    }
}
