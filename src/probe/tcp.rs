//! TCP connect probe implementation.

use std::time::Duration;
use tokio::net::TcpStream;

use super::ProbeError;

/// Open a TCP connection to the endpoint and drop it immediately.
///
/// Name resolution counts against the same timeout as the connect.
pub async fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Network(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Network(_)) | Err(ProbeError::Timeout(_))));
    }
}
