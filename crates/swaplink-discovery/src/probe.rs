//! Identity probe: `GET http://<host>:<port>/identity`.

use std::time::Duration;

use async_trait::async_trait;
use swaplink_core::errors::ProbeError;
use swaplink_core::net::http_authority;
use swaplink_core::protocol::{IdentityInfo, IDENTITY_PATH};

use crate::Candidate;

#[async_trait]
pub trait IdentityProber: Send + Sync {
    /// Fetch and validate the identity of `candidate`. Only a ready node
    /// carrying `marker` counts as success.
    async fn probe(&self, candidate: &Candidate, marker: &str) -> Result<IdentityInfo, ProbeError>;
}

/// reqwest-backed prober with a per-request timeout.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IdentityProber for HttpProber {
    async fn probe(&self, candidate: &Candidate, marker: &str) -> Result<IdentityInfo, ProbeError> {
        let url = format!("http://{}{}", http_authority(&candidate.host, candidate.port), IDENTITY_PATH);
        let host = candidate.host.clone();

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout { host: host.clone() }
            } else {
                ProbeError::Unreachable { host: host.clone(), reason: e.to_string() }
            }
        })?;

        if !resp.status().is_success() {
            return Err(ProbeError::UnexpectedPayload {
                host,
                reason: format!("HTTP {}", resp.status()),
            });
        }

        let info: IdentityInfo = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout { host: host.clone() }
            } else {
                ProbeError::UnexpectedPayload { host: host.clone(), reason: e.to_string() }
            }
        })?;

        if !info.is_ready_for(marker) {
            return Err(ProbeError::UnexpectedPayload {
                host,
                reason: format!("app={} status={}", info.app, info.status),
            });
        }
        Ok(info)
    }
}
