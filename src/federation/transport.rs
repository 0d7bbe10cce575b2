//! Outbound HTTP capability
//!
//! Actor fetches and inbox deliveries go through `OutboundFetch` so the
//! network can be swapped out in tests.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::FederationConfig;

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure before any HTTP status was received
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    /// Destination rejected by the network guard; never worth retrying
    #[error("destination not allowed: {0}")]
    Blocked(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Blocked(_) | FetchError::InvalidUrl(_))
    }
}

#[async_trait]
pub trait OutboundFetch: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, FetchError>;
}

// =============================================================================
// Network guard
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Check scheme and host of a remote URL without touching the network.
///
/// Rejects non-HTTP(S) URLs, and local/private literal hosts unless
/// `allow_private` is set.
pub fn check_remote_url(url: &str, allow_private: bool) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl("missing host".to_string()))?;

    if !allow_private && is_disallowed_host(host) {
        return Err(FetchError::Blocked(host.to_string()));
    }

    Ok(parsed)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), FetchError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| FetchError::Connect(format!("failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(FetchError::Blocked(host.to_string()));
        }
    }

    if !resolved_any {
        return Err(FetchError::Connect(format!("no DNS records for {}", host)));
    }

    Ok(())
}

// =============================================================================
// reqwest implementation
// =============================================================================

/// Production fetcher backed by reqwest
pub struct ReqwestFetcher {
    client: reqwest::Client,
    allow_private_networks: bool,
}

impl ReqwestFetcher {
    pub fn new(config: &FederationConfig) -> Result<Self, crate::error::AppError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout().min(Duration::from_secs(5)))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            allow_private_networks: config.allow_private_networks,
        })
    }
}

#[async_trait]
impl OutboundFetch for ReqwestFetcher {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, FetchError> {
        let url = check_remote_url(&request.url, self.allow_private_networks)?;

        if !self.allow_private_networks {
            let host = url
                .host_str()
                .ok_or_else(|| FetchError::InvalidUrl("missing host".to_string()))?;
            let port = url
                .port_or_known_default()
                .ok_or_else(|| FetchError::InvalidUrl("missing port".to_string()))?;
            // Hosts that look public may still resolve internally
            validate_resolved_host_ips(host, port).await?;
        }

        let started = Instant::now();
        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let result = builder.send().await;
        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = result.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(OutboundResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Connect(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_remote_url_rejects_localhost_and_private_ips() {
        assert!(matches!(
            check_remote_url("https://localhost/users/alice", false),
            Err(FetchError::Blocked(_))
        ));
        assert!(matches!(
            check_remote_url("http://192.168.1.10/inbox", false),
            Err(FetchError::Blocked(_))
        ));
        assert!(matches!(
            check_remote_url("http://[::1]:8080/inbox", false),
            Err(FetchError::Blocked(_))
        ));
    }

    #[test]
    fn check_remote_url_allows_private_when_enabled() {
        assert!(check_remote_url("http://127.0.0.1:3000/inbox", true).is_ok());
    }

    #[test]
    fn check_remote_url_rejects_other_schemes() {
        assert!(matches!(
            check_remote_url("ftp://example.com/inbox", true),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn check_remote_url_accepts_public_host() {
        let url = check_remote_url("https://example.com/users/alice", false)
            .expect("public host should be accepted");
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[tokio::test]
    async fn validate_resolved_host_ips_rejects_loopback() {
        match validate_resolved_host_ips("127.0.0.1", 80).await {
            Err(FetchError::Blocked(_)) => {}
            other => panic!("expected blocked loopback resolution, got: {other:?}"),
        }
    }
}
