//! Probe module for endpoint reachability.
//!
//! Supports HTTP HEAD and plain TCP connect probes. A probe answers one
//! question, "did the device respond in time", and never retries.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// Timeouts and network failures are part of the error type so the
/// individual probes can report them, but [`classify`] folds both into
/// [`ProbeOutcome::Unreachable`]. Only `Internal` escapes as an error.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("internal probe fault: {0}")]
    Internal(String),
}

/// Result of a single probe that actually ran (or was skipped as unconfigured).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
    NotConfigured,
}

impl ProbeOutcome {
    /// The sample value fed to the state machine, `None` when nothing was probed.
    pub fn reachable(self) -> Option<bool> {
        match self {
            ProbeOutcome::Reachable => Some(true),
            ProbeOutcome::Unreachable => Some(false),
            ProbeOutcome::NotConfigured => None,
        }
    }
}

/// How endpoints are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Http,
    Tcp,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProbeMode::Http),
            "tcp" => Ok(ProbeMode::Tcp),
            other => Err(format!("unknown probe mode: {}", other)),
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMode::Http => f.write_str("http"),
            ProbeMode::Tcp => f.write_str("tcp"),
        }
    }
}

/// A single reachability check against one endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> Result<ProbeOutcome, ProbeError>;
}

/// Prober that talks to the real network.
pub struct NetworkProber {
    mode: ProbeMode,
    timeout: Duration,
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new(mode: ProbeMode, timeout: Duration) -> Result<Self, ProbeError> {
        Ok(Self {
            mode,
            timeout,
            client: build_http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, host: &str, port: u16) -> Result<ProbeOutcome, ProbeError> {
        let host = host.trim();
        if host.is_empty() {
            return Ok(ProbeOutcome::NotConfigured);
        }

        // Add jitter to avoid thundering herd
        let jitter = Duration::from_millis(rand::random::<u64>() % 100);
        let (jitter, budget) = split_jitter(self.timeout, jitter);
        tokio::time::sleep(jitter).await;

        let result = match self.mode {
            ProbeMode::Http => run_http_probe(&self.client, host, port, budget).await,
            ProbeMode::Tcp => run_tcp_probe(host, port, budget).await,
        };

        classify(result)
    }
}

/// Split a probe timeout into the start jitter and what is left for the probe.
///
/// The jitter never takes more than half the timeout.
pub fn split_jitter(timeout: Duration, jitter: Duration) -> (Duration, Duration) {
    let jitter = jitter.min(timeout / 2);
    (jitter, timeout - jitter)
}

/// Fold a raw probe result into an outcome.
pub fn classify(result: Result<(), ProbeError>) -> Result<ProbeOutcome, ProbeError> {
    match result {
        Ok(()) => Ok(ProbeOutcome::Reachable),
        Err(ProbeError::Timeout(_)) | Err(ProbeError::Network(_)) => Ok(ProbeOutcome::Unreachable),
        Err(e) => Err(e),
    }
}
