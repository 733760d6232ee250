//! Outbound half of the handshake: `POST /pair/request` and `POST /pair/confirm`.

use std::time::Duration;

use async_trait::async_trait;
use swaplink_core::errors::PairingError;
use swaplink_core::net::http_authority;
use swaplink_core::protocol::{
    ConfirmRequest, PairRequest, PairResponse, PairStatus, PAIR_CONFIRM_PATH, PAIR_REQUEST_PATH,
};

#[async_trait]
pub trait PairingClient: Send + Sync {
    /// Ask `hostname` to pair. Returns the peer identity on acceptance.
    async fn request(&self, hostname: &str, local_identity: &str) -> Result<String, PairingError>;

    /// Tell `hostname` the pairing is confirmed.
    async fn confirm(&self, hostname: &str, local_identity: &str) -> Result<(), PairingError>;
}

/// reqwest-backed client. Peers are assumed to serve on the same port as we do.
pub struct HttpPairingClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpPairingClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, port })
    }

    async fn post<B: serde::Serialize + Sync>(
        &self,
        hostname: &str,
        path: &str,
        body: &B,
    ) -> Result<PairResponse, PairingError> {
        let url = format!("http://{}{}", http_authority(hostname, self.port), path);
        let host = hostname.to_owned();

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&host, e))?;

        if !resp.status().is_success() {
            return Err(PairingError::Malformed {
                host,
                reason: format!("HTTP {}", resp.status()),
            });
        }

        resp.json::<PairResponse>().await.map_err(|e| {
            if e.is_timeout() {
                PairingError::Timeout { host: host.clone() }
            } else {
                PairingError::Malformed { host: host.clone(), reason: e.to_string() }
            }
        })
    }
}

fn transport_error(host: &str, e: reqwest::Error) -> PairingError {
    if e.is_timeout() {
        PairingError::Timeout { host: host.to_owned() }
    } else {
        PairingError::Unreachable { host: host.to_owned(), reason: e.to_string() }
    }
}

/// Turn a response body into the outcome the coordinator cares about.
fn interpret(host: &str, resp: PairResponse, expect: PairStatus) -> Result<PairResponse, PairingError> {
    match resp.status {
        PairStatus::Rejected => Err(PairingError::Rejected {
            host: host.to_owned(),
            reason: resp.reason.unwrap_or_else(|| "unspecified".to_owned()),
        }),
        status if status == expect => Ok(resp),
        other => Err(PairingError::Malformed {
            host: host.to_owned(),
            reason: format!("unexpected status {other:?}"),
        }),
    }
}

#[async_trait]
impl PairingClient for HttpPairingClient {
    async fn request(&self, hostname: &str, local_identity: &str) -> Result<String, PairingError> {
        let body = PairRequest { requester_id: local_identity.to_owned() };
        let resp = self.post(hostname, PAIR_REQUEST_PATH, &body).await?;
        let resp = interpret(hostname, resp, PairStatus::Accepted)?;
        resp.peer_id.filter(|id| !id.is_empty()).ok_or_else(|| PairingError::Malformed {
            host: hostname.to_owned(),
            reason: "accepted without peerId".to_owned(),
        })
    }

    async fn confirm(&self, hostname: &str, local_identity: &str) -> Result<(), PairingError> {
        let body = ConfirmRequest { peer_id: local_identity.to_owned() };
        let resp = self.post(hostname, PAIR_CONFIRM_PATH, &body).await?;
        interpret(hostname, resp, PairStatus::Confirmed).map(|_| ())
    }
}
