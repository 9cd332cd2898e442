use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Authentication applied to outgoing requests. Secrets are never logged.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Header { name: String, value: String },
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
            Self::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
        }
    }
}

impl HttpAuth {
    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
            Self::Header { name, value } => {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
    }
}

/// GET request envelope used by adapter transport calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport-level failure: the request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HttpError {
    message: String,
}

impl HttpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

/// Transport seam for HTTP-backed adapters.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("tickpipe/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        Box::pin(async move {
            let mut builder = self.client.get(&request.url).timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let response = builder.send().await.map_err(|err| {
                if err.is_timeout() {
                    HttpError::new(format!("request timeout: {err}"))
                } else if err.is_connect() {
                    HttpError::new(format!("connection failed: {err}"))
                } else {
                    HttpError::new(format!("request failed: {err}"))
                }
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|err| HttpError::new(format!("failed to read response body: {err}")))?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}
