//! HTTP Transport
//!
//! HTTP client interface for the token endpoint call, behind a trait so the
//! refresh coordinator can be tested against a recorded transport.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{TokenManagerError, TransientRefreshError};

/// HTTP request definition.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// Request URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Form-encoded request body.
    pub body: String,
    /// Request timeout.
    pub timeout: Option<Duration>,
}

/// HTTP response definition.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: String,
}

/// HTTP transport interface (for dependency injection).
///
/// Transport failures are always transient: the network saying nothing is
/// never proof the grant is gone.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a form-encoded request.
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TokenManagerError>;
}

/// Default reqwest-based HTTP transport.
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestHttpTransport {
    /// Create new transport with a default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        // Failing loudly beats a default client that follows redirects and
        // has no timeout.
        let client = reqwest::Client::builder()
            .timeout(default_timeout)
            // Token endpoints must answer directly, never via redirect.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            default_timeout,
        }
    }
}

impl Default for ReqwestHttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TokenManagerError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self.client.post(&request.url).timeout(timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            let error = if e.is_timeout() {
                TransientRefreshError::Timeout { timeout }
            } else {
                TransientRefreshError::ConnectionFailed {
                    message: e.to_string(),
                }
            };
            TokenManagerError::Transient(error)
        })?;

        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.to_string().to_lowercase(), v.to_string());
            }
        }

        let body = response.text().await.map_err(|e| {
            TokenManagerError::Transient(TransientRefreshError::ConnectionFailed {
                message: e.to_string(),
            })
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mock HTTP transport for testing.
///
/// Responses are served queue-first, then the default response. Request
/// history records every call, which is how the single-flight tests count
/// network refreshes.
#[derive(Default)]
pub struct MockHttpTransport {
    responses: std::sync::Mutex<Vec<HttpResponse>>,
    default_response: std::sync::Mutex<Option<HttpResponse>>,
    request_history: std::sync::Mutex<Vec<HttpRequest>>,
    response_delay: std::sync::Mutex<Option<Duration>>,
}

impl MockHttpTransport {
    /// Create new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to return (FIFO).
    pub fn queue_response(&self, response: HttpResponse) -> &Self {
        self.responses.lock().unwrap().push(response);
        self
    }

    /// Queue a JSON response with the given status.
    pub fn queue_json_response<T: serde::Serialize>(&self, status: u16, body: &T) -> &Self {
        self.queue_response(HttpResponse {
            status,
            headers: [("content-type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
            body: serde_json::to_string(body).unwrap(),
        })
    }

    /// Set the response returned when the queue is empty.
    pub fn set_default_response(&self, response: HttpResponse) -> &Self {
        *self.default_response.lock().unwrap() = Some(response);
        self
    }

    /// Delay every response, to hold a refresh in flight during tests.
    pub fn set_response_delay(&self, delay: Duration) -> &Self {
        *self.response_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Get request history.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.request_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TokenManagerError> {
        self.request_history.lock().unwrap().push(request);

        let delay = *self.response_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = {
            let mut queue = self.responses.lock().unwrap();
            if queue.is_empty() {
                self.default_response.lock().unwrap().clone()
            } else {
                Some(queue.remove(0))
            }
        };

        response.ok_or_else(|| {
            TokenManagerError::Transient(TransientRefreshError::ConnectionFailed {
                message: "no mock response available".to_string(),
            })
        })
    }
}
