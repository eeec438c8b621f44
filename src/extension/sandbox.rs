//! Host-side policy for extension scripts
//!
//! Scripts cannot reach the network on their own; every request goes
//! through the host `fetch` binding, which asks the sandbox first.
//! [`ScriptSandbox::send`] follows redirects itself so that each hop is
//! checked against the same policy.

use crate::core::config::ExtensionsConfig;
use crate::core::error::{Result, TsukiyoError};
use crate::core::http::{HttpRequest, HttpResponse, HttpTransport};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

pub const MAX_REDIRECTS: usize = 10;

/// Headers not carried over when a redirect changes host
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// Network policy and resource limits applied to every script
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    /// Empty means any public host
    allowed_domains: Vec<String>,
    allow_private_hosts: bool,
    max_response_bytes: usize,
    pub limits: ResourceLimits,
}

impl ScriptSandbox {
    pub fn new(
        allowed_domains: Vec<String>,
        allow_private_hosts: bool,
        max_response_bytes: usize,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            allowed_domains,
            allow_private_hosts,
            max_response_bytes,
            limits,
        }
    }

    pub fn from_config(config: &ExtensionsConfig) -> Self {
        Self::new(
            config.allowed_domains.clone(),
            config.allow_private_hosts,
            config.max_response_bytes,
            ResourceLimits {
                max_evaluation_time: config.evaluation_deadline(),
                max_call_time: config.call_deadline(),
            },
        )
    }

    /// Check if a script may request the given URL
    pub fn check_network_access(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| TsukiyoError::PermissionDenied(format!("Invalid URL '{}': {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(TsukiyoError::PermissionDenied(format!(
                "Network access denied: scheme '{}' is not allowed",
                url.scheme()
            )));
        }

        let host = url
            .host()
            .ok_or_else(|| TsukiyoError::PermissionDenied(format!("Network access denied: no host in {}", raw)))?;

        if !self.allow_private_hosts && is_private_host(&host) {
            return Err(TsukiyoError::PermissionDenied(format!(
                "Network access denied: private host {}",
                host
            )));
        }

        if !self.allowed_domains.is_empty() {
            let domain = host.to_string().to_ascii_lowercase();
            let allowed = self
                .allowed_domains
                .iter()
                .any(|pattern| domain_matches(&domain, &pattern.to_ascii_lowercase()));
            if !allowed {
                return Err(TsukiyoError::PermissionDenied(format!("Network access denied: {}", domain)));
            }
        }

        Ok(url)
    }

    /// Check a response body against the size limit
    pub fn check_response_size(&self, bytes: usize) -> Result<()> {
        if bytes > self.max_response_bytes {
            return Err(TsukiyoError::PermissionDenied(format!(
                "Response too large: {} bytes (limit: {} bytes)",
                bytes, self.max_response_bytes
            )));
        }
        Ok(())
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    pub fn max_response_bytes(&self) -> usize {
        self.max_response_bytes
    }

    /// Send a request under this policy
    ///
    /// The first URL and every redirect target must pass
    /// [`check_network_access`](Self::check_network_access); bodies are capped
    /// at the response size limit while they are read.
    pub async fn send(&self, transport: &dyn HttpTransport, mut request: HttpRequest) -> Result<HttpResponse> {
        let mut current = self.check_network_access(&request.url)?;

        for _ in 0..=MAX_REDIRECTS {
            request.url = current.to_string();
            request.follow_redirects = false;
            request.max_body_bytes = Some(self.max_response_bytes);

            let response = transport.send(request.clone()).await?;
            let location = match response.redirect_location() {
                Some(location) => location,
                None => {
                    self.check_response_size(response.body.len())?;
                    return Ok(response);
                }
            };

            let next = current
                .join(location)
                .map_err(|e| TsukiyoError::NetworkError(format!("Bad redirect from {}: {}", current, e)))?;
            let next = self.check_network_access(next.as_str())?;
            debug!(from = %current, to = %next, status = response.status, "Following redirect");

            if response.status == 303
                || (matches!(response.status, 301 | 302) && !matches!(request.method.as_str(), "GET" | "HEAD"))
            {
                request.method = "GET".to_string();
                request.body = None;
            }
            if next.host_str() != current.host_str() {
                request
                    .headers
                    .retain(|(name, _)| !CREDENTIAL_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
            }
            current = next;
        }

        Err(TsukiyoError::NetworkError(format!(
            "Too many redirects (more than {}) starting at {}",
            MAX_REDIRECTS, request.url
        )))
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(Vec::new(), false, 16 * 1024 * 1024, ResourceLimits::default())
    }
}

/// Check if domain matches pattern (supports `*.` wildcards)
fn domain_matches(domain: &str, pattern: &str) -> bool {
    if let Some(base) = pattern.strip_prefix("*.") {
        domain == base || domain.ends_with(&format!(".{}", base))
    } else {
        domain == pattern
    }
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
        }
        Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(*ip)),
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || *v4 == Ipv4Addr::new(169, 254, 169, 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().map(|v4| is_private_ip(&IpAddr::V4(v4))).unwrap_or(false)
                || *v6 == Ipv6Addr::LOCALHOST
        }
    }
}

/// Time limits for script execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Top-level evaluation of a script
    pub max_evaluation_time: Duration,
    /// One contract call, including the requests it makes
    pub max_call_time: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_evaluation_time: Duration::from_secs(10),
            max_call_time: Duration::from_secs(60),
        }
    }
}
