use crate::backoff::{send_with_backoff, RetryPolicy};
use crate::metrics;
use crate::types::RelayPayload;
use crate::{Error, RelayClient, SensitiveUrl};
use alloy_primitives::B256;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Relays polled for delivered payloads, see https://ethstaker.cc/mev-relay-list/
pub const MAINNET_RELAYS: &[&str] = &[
    "https://boost-relay.flashbots.net",
    "https://relay-analytics.ultrasound.money",
    "https://agnostic-relay.net",
    "https://bloxroute.max-profit.blxrbdn.com",
    "https://bloxroute.regulated.blxrbdn.com",
    "https://mainnet-relay.securerpc.com",
    "https://relay.wenmerge.com",
    "https://aestus.live",
    "https://titanrelay.xyz",
];

/// A client for the `relay/v1/data` API of an MEV relay.
#[derive(Clone)]
pub struct RelayHttpClient {
    client: reqwest::Client,
    server: SensitiveUrl,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RelayHttpClient {
    pub fn new(server: SensitiveUrl) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
            timeout: DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::get(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Build clients for every relay in `MAINNET_RELAYS`.
    pub fn mainnet() -> Result<Vec<Self>, Error> {
        MAINNET_RELAYS
            .iter()
            .map(|url| -> Result<Self, Error> { Ok(Self::new(SensitiveUrl::parse(url)?)) })
            .collect()
    }
}

/// Validates the relay's answer to a `proposer_payload_delivered` query for `block_hash`.
pub fn select_payload(
    payloads: Vec<RelayPayload>,
    block_hash: B256,
) -> Result<Option<RelayPayload>, Error> {
    let mut payloads = payloads.into_iter();
    let Some(payload) = payloads.next() else {
        return Ok(None);
    };
    if payloads.next().is_some() {
        return Err(Error::InvalidResponse(format!(
            "More than one delivered payload for block hash {}",
            block_hash
        )));
    }
    if payload.block_hash != block_hash {
        return Err(Error::InvalidResponse(format!(
            "Delivered payload has block hash {}, expected {}",
            payload.block_hash, block_hash
        )));
    }
    Ok(Some(payload))
}

#[async_trait]
impl RelayClient for RelayHttpClient {
    fn name(&self) -> &str {
        self.server.as_ref()
    }

    async fn get_payload(&self, block_hash: B256) -> Result<Option<RelayPayload>, Error> {
        metrics::inc_counter_vec(
            &metrics::CHAIN_CLIENT_REQUESTS,
            &[metrics::RELAY, "proposer_payload_delivered"],
        );
        let mut url = self.server.join_segments(&[
            "relay",
            "v1",
            "data",
            "bidtraces",
            "proposer_payload_delivered",
        ])?;
        url.query_pairs_mut()
            .append_pair("block_hash", &format!("{:#x}", block_hash));

        let request = self.client.get(url).timeout(self.timeout);
        let response = send_with_backoff(request, &self.retry_policy, metrics::RELAY).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payloads: Vec<RelayPayload> = response.json().await?;
        select_payload(payloads, block_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn payload(block_hash: B256) -> RelayPayload {
        RelayPayload {
            slot: 5_000_000,
            block_hash,
            builder_pubkey: "0xa1".into(),
            proposer_fee_recipient: Address::repeat_byte(0x11),
            value: U256::from(1u64),
            block_number: 15_835_292,
        }
    }

    #[test]
    fn empty_response_is_not_delivered() {
        assert_eq!(select_payload(vec![], B256::ZERO).unwrap(), None);
    }

    #[test]
    fn mismatched_or_duplicate_payloads_are_rejected() {
        let hash = B256::repeat_byte(1);
        assert!(select_payload(vec![payload(B256::repeat_byte(2))], hash).is_err());
        assert!(select_payload(vec![payload(hash), payload(hash)], hash).is_err());
        assert_eq!(
            select_payload(vec![payload(hash)], hash).unwrap(),
            Some(payload(hash))
        );
    }

    #[test]
    fn mainnet_relays_parse() {
        assert_eq!(RelayHttpClient::mainnet().unwrap().len(), MAINNET_RELAYS.len());
    }
}
