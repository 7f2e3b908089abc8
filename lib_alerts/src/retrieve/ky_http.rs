//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with middleware support
//! for exponential backoff retries and standardized JSON response handling.
//! Request bodies can be JSON or `application/x-www-form-urlencoded`, the latter
//! being what the alert server's reset endpoint expects.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// Per-request timeout for control calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with metadata about the HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Encoded request body together with its content type.
enum Payload {
    Json(String),
    Form(String),
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, authentication
/// tokens, and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` with a three-retry exponential backoff policy.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the HTTP client cannot be built.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("AlertClient/1.0")
            .build()?;
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    /// The base URL every path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request with an optional JSON body.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path to append to the base URL (`""` hits the base URL itself).
    /// * `headers` - Optional additional headers for this specific request.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, serialization or network execution fails.
    /// Non-2xx replies are not errors; they come back with `success: false`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let payload = match body {
            Some(b) => Some(Payload::Json(serde_json::to_string(&b)?)),
            None => None,
        };
        self.execute(method, path, headers, payload).await
    }

    /// POSTs `fields` as an urlencoded form.
    pub async fn post_form<T>(&self, path: &str, fields: &[(&str, &str)]) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter())
            .finish();
        self.execute(Method::POST, path, None, Some(Payload::Form(encoded))).await
    }

    async fn execute<T>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        payload: Option<Payload>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        match payload {
            Some(Payload::Json(body)) => {
                req = req.header(CONTENT_TYPE, "application/json").body(body);
            }
            Some(Payload::Form(body)) => {
                req = req
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body);
            }
            None => {}
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(ApiClient::new("/api/poll/reset/", None).is_err());
    }

    #[test]
    fn empty_path_targets_the_base_url() {
        let client = ApiClient::new("http://localhost:8001/api/poll/reset/", None).unwrap();
        let joined = client.base_url().join("").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:8001/api/poll/reset/");
    }
}
