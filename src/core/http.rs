//! HTTP transport
//!
//! Every remote request the runtime makes (script downloads, calls made by
//! extension scripts, the built-in source, page image downloads) goes
//! through an [`HttpTransport`].

use crate::core::error::{Result, TsukiyoError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Outgoing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    /// Off: a 3xx comes back as the response
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    /// Fail once the body grows past this many bytes
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

fn default_follow_redirects() -> bool {
    true
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            follow_redirects: true,
            max_body_bytes: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn max_body(mut self, bytes: usize) -> Self {
        self.max_body_bytes = Some(bytes);
        self
    }
}

/// Error for a body larger than the request allows
pub fn body_too_large(url: &str, limit: usize) -> TsukiyoError {
    TsukiyoError::PermissionDenied(format!("Response from {} exceeds {} bytes", url, limit))
}

/// Response with the full body buffered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Target of a 301/302/303/307/308 response
    pub fn redirect_location(&self) -> Option<&str> {
        match self.status {
            301 | 302 | 303 | 307 | 308 => self.header("location"),
            _ => None,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Something that can perform HTTP requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by shared reqwest clients
///
/// Requests with `follow_redirects` off use a second client whose redirect
/// policy is `none`, so the caller sees every hop.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    direct: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, reqwest::redirect::Policy::default())?,
            direct: build_client(timeout, reqwest::redirect::Policy::none())?,
        })
    }
}

fn build_client(timeout: Duration, redirects: reqwest::redirect::Policy) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(redirects)
        .user_agent(concat!("tsukiyo/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TsukiyoError::NetworkError(format!("Failed to build HTTP client: {}", e)))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| TsukiyoError::ValidationError(format!("Invalid HTTP method: {}", request.method)))?;

        let client = if request.follow_redirects { &self.client } else { &self.direct };
        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!(url = %request.url, method = %request.method, "Sending request");

        let mut response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        if let Some(limit) = request.max_body_bytes {
            if response.content_length().map_or(false, |len| len > limit as u64) {
                return Err(body_too_large(&url, limit));
            }
        }
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if let Some(limit) = request.max_body_bytes {
                if body.len() + chunk.len() > limit {
                    return Err(body_too_large(&url, limit));
                }
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url = %url, status, bytes = body.len(), "Request completed");

        Ok(HttpResponse { status, url, headers, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TsukiyoError {
    if err.is_timeout() {
        TsukiyoError::Timeout(err.to_string())
    } else {
        TsukiyoError::NetworkError(err.to_string())
    }
}

/// Canned-response transport
///
/// Routes are matched by URL prefix, longest prefix first. Unmatched
/// requests get a 404. Redirects are returned as-is, never followed.
/// Every request is recorded.
#[derive(Debug, Default)]
pub struct StaticTransport {
    routes: Mutex<Vec<(String, HttpResponse)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, prefix: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) {
        self.route_with_headers(prefix, status, Vec::new(), body);
    }

    pub fn route_json(&self, prefix: impl Into<String>, value: &serde_json::Value) {
        self.route_with_headers(
            prefix,
            200,
            vec![("content-type".to_string(), "application/json".to_string())],
            value.to_string(),
        );
    }

    pub fn route_with_headers(
        &self,
        prefix: impl Into<String>,
        status: u16,
        headers: Vec<(String, String)>,
        body: impl Into<Vec<u8>>,
    ) {
        let prefix = prefix.into();
        let response = HttpResponse {
            status,
            url: prefix.clone(),
            headers,
            body: body.into(),
        };

        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.retain(|(existing, _)| existing != &prefix);
        routes.push((prefix, response));
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl HttpTransport for StaticTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let matched = routes
            .iter()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, response)| response.clone());

        let response = match matched {
            Some(mut response) => {
                response.url = request.url;
                response
            }
            None => HttpResponse {
                status: 404,
                url: request.url,
                headers: Vec::new(),
                body: b"not found".to_vec(),
            },
        };

        match request.max_body_bytes {
            Some(limit) if response.body.len() > limit => Err(body_too_large(&response.url, limit)),
            _ => Ok(response),
        }
    }
}
