use std::future::Future;
use std::time::Duration;

use swaplink_core::errors::PairingError;
use tracing::debug;

/// Fixed-delay retry for pairing calls. Only retryable errors (timeouts)
/// get another attempt; rejections and malformed replies are final.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, PairingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PairingError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    debug!("[Pairing] {} (attempt {}/{}), retrying", e, attempt, self.retries);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
