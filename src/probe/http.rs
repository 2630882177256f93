//! HTTP probe implementation.

use std::time::Duration;
use super::ProbeError;

/// Build the shared client used by HTTP probes.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| ProbeError::Internal(e.to_string()))
}

/// Build the probe URL for a host and port.
pub fn probe_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.to_string();
    }

    let scheme = if port == 443 { "https" } else { "http" };
    if host.contains(':') && !host.starts_with('[') {
        // Bare IPv6 literal
        format!("{}://[{}]:{}/", scheme, host, port)
    } else {
        format!("{}://{}:{}/", scheme, host, port)
    }
}

/// Run a HEAD request against the endpoint.
///
/// Any HTTP response counts as reachable, including error statuses: a router
/// answering 401 is still powered.
pub async fn run_http_probe(
    client: &reqwest::Client,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), ProbeError> {
    let url = probe_url(host, port);

    let response = client
        .head(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if e.is_builder() {
                ProbeError::Internal(e.to_string())
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    tracing::trace!("HEAD {} -> {}", url, response.status());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("192.168.1.1", 80), "http://192.168.1.1:80/");
        assert_eq!(probe_url("router.example", 443), "https://router.example:443/");
        assert_eq!(probe_url("fe80::1", 8080), "http://[fe80::1]:8080/");
        assert_eq!(probe_url("http://10.0.0.1:81/ping", 80), "http://10.0.0.1:81/ping");
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_address() {
        let client = build_http_client(Duration::from_millis(100)).unwrap();
        let result = run_http_probe(&client, "256.256.256.256", 80, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
