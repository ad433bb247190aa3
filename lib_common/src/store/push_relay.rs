//! # HTTP Push Relay
//!
//! Minimal [`PushDelivery`] implementation that hands each payload to the
//! subscription's push-service URL over HTTPS. Message encryption and VAPID
//! signing are the relay's concern on the other side of that URL.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;

use crate::models::PushEndpoint;
use crate::store::PushDelivery;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("care-events/", env!("CARGO_PKG_VERSION"));

/// Stateless HTTP delivery; one shared client with connection reuse.
pub struct HttpPushRelay {
    client: Client,
}

impl HttpPushRelay {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushDelivery for HttpPushRelay {
    async fn deliver(&self, endpoint: &PushEndpoint, payload: &[u8]) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&endpoint.endpoint)
            .header("Content-Type", "application/json")
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("push service returned {}", status);
        }
        debug!("Push delivered to {} ({})", endpoint.endpoint, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_builds_with_timeout_and_user_agent() {
        assert!(HttpPushRelay::new().is_ok());
    }
}
