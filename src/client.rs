//! HTTP client module for the SensorThings API.
//!
//! This module provides an async HTTP client with connection pooling and
//! proper error handling for the two endpoints the spooler talks to: the
//! token login endpoint and the batch `CreateObservations` endpoint.
//! Failed submissions are not retried here; the delivery loop picks the
//! rows up again on its next cycle.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;

/// Longest response body excerpt quoted in error messages
const MAX_QUOTED_BODY: usize = 200;

/// Login request body expected by the auth endpoint.
#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    id: &'a str,
    key: &'a str,
}

/// Login response body.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
}

/// Per-row outcome parsed from a `CreateObservations` response entry.
///
/// The server answers with one entry per submitted observation, in
/// submission order: an entity URL string or id object for created rows,
/// or an error string for rejected ones.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// The observation was created
    Accepted,

    /// The observation was rejected with the server's error text
    Rejected { message: String },
}

impl RowOutcome {
    /// Classify one response entry. A string starting with `error` marks a
    /// rejection; every other entry shape is an acceptance.
    pub fn from_entry(entry: &Value) -> Self {
        match entry {
            Value::String(s) if s.starts_with("error") => RowOutcome::Rejected {
                message: s.clone(),
            },
            _ => RowOutcome::Accepted,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, RowOutcome::Accepted)
    }
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug)]
pub enum TransportError {
    /// Token login failed
    Authentication {
        status: Option<StatusCode>,
        message: String,
    },

    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an unexpected status code
    Status { code: StatusCode, message: String },

    /// Request timeout
    Timeout,

    /// Response body did not have the promised shape
    UnexpectedResponse(String),

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Authentication {
                status: Some(code),
                message,
            } => write!(f, "Authentication failed ({}): {}", code, message),
            TransportError::Authentication {
                status: None,
                message,
            } => write!(f, "Authentication failed: {}", message),
            TransportError::Request(e) => write!(f, "HTTP request failed: {}", e),
            TransportError::Status { code, message } => {
                write!(f, "Server error ({}): {}", code, message)
            }
            TransportError::Timeout => write!(f, "Request timed out"),
            TransportError::UnexpectedResponse(e) => {
                write!(f, "Unexpected response from server: {}", e)
            }
            TransportError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// HTTP client for the SensorThings API.
///
/// The client uses connection pooling (via reqwest's internal pool) and
/// respects the configured timeout on every request.
///
/// # Example
///
/// ```no_run
/// use obs_spooler::client::StaClient;
/// use obs_spooler::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = StaClient::new(&config).expect("Failed to create client");
///
///     match client.login(&config.client_id, &config.client_key).await {
///         Ok(token) => println!("Authenticated, token length {}", token.len()),
///         Err(e) => eprintln!("Login failed: {}", e),
///     }
/// }
/// ```
pub struct StaClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL for the batch observation endpoint
    create_url: String,

    /// URL for the token login endpoint
    auth_url: String,

    /// Request timeout duration
    timeout: Duration,
}

impl StaClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_settings(
            config.create_url.clone(),
            config.auth_url.clone(),
            config.request_timeout,
            config.verify_tls,
        )
    }

    /// Create a new client with custom settings.
    ///
    /// This is useful for testing or when you need more control over the client.
    pub fn with_settings(
        create_url: impl Into<String>,
        auth_url: impl Into<String>,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            create_url: create_url.into(),
            auth_url: auth_url.into(),
            timeout,
        })
    }

    /// Obtain a bearer token from the auth endpoint.
    ///
    /// Any failure along the way (transport, non-200 status, malformed or
    /// empty token body) surfaces as `TransportError::Authentication`.
    pub async fn login(
        &self,
        client_id: &str,
        client_key: &str,
    ) -> Result<String, TransportError> {
        debug!(url = %self.auth_url, "Requesting bearer token");

        let request = LoginRequest {
            id: client_id,
            key: client_key,
        };

        let response = self
            .client
            .post(&self.auth_url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Authentication {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Authentication {
                status: Some(status),
                message: quote_body(&message),
            });
        }

        let body: LoginResponse =
            response
                .json()
                .await
                .map_err(|e| TransportError::Authentication {
                    status: None,
                    message: format!("invalid login response: {}", e),
                })?;

        if body.token.is_empty() {
            return Err(TransportError::Authentication {
                status: None,
                message: "login response carried no token".to_string(),
            });
        }

        info!("Obtained bearer token");
        Ok(body.token)
    }

    /// Submit a `CreateObservations` batch and parse the per-row outcomes.
    ///
    /// Success is strictly HTTP 201 with a JSON array body; the returned
    /// outcomes are in submission order, one per submitted element.
    pub async fn create_observations(
        &self,
        token: &str,
        payload: &Value,
    ) -> Result<Vec<RowOutcome>, TransportError> {
        debug!(url = %self.create_url, "Submitting observation batch");

        let response = self
            .client
            .post(&self.create_url)
            .timeout(self.timeout)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Status {
                code: status,
                message: quote_body(&message),
            });
        }

        let body = response.text().await?;
        let entries: Vec<Value> = serde_json::from_str(&body).map_err(|_| {
            TransportError::UnexpectedResponse(format!(
                "expected a JSON array, got: {}",
                quote_body(&body)
            ))
        })?;

        Ok(entries.iter().map(RowOutcome::from_entry).collect())
    }

    /// Get the configured batch endpoint URL.
    pub fn create_url(&self) -> &str {
        &self.create_url
    }

    /// Get the configured auth endpoint URL.
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Bound a response body excerpt for inclusion in an error message.
fn quote_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_QUOTED_BODY {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_QUOTED_BODY).collect();
        format!("{}...", cut)
    }
}
