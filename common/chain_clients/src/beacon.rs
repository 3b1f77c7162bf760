use crate::backoff::{send_with_backoff, RetryPolicy};
use crate::metrics;
use crate::types::{
    BlockResponse, FinalityCheckpoints, GenericResponse, HeaderResponse, SlotProposerData,
    ValidatorBalance, ValidatorSummary, Withdrawal, FAR_FUTURE_EPOCH, SLOTS_PER_EPOCH,
};
use crate::{BeaconClient, Error, SensitiveUrl};
use async_trait::async_trait;
use log::debug;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Querying balances of the full validator set returns a very large body.
const BALANCES_TIMEOUT: Duration = Duration::from_secs(300);
/// Keeps the `id` query parameter well below common URL length limits.
const MAX_IDS_PER_REQUEST: usize = 100;

#[derive(Clone)]
pub struct Timeouts {
    pub default: Duration,
    pub balances: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_TIMEOUT,
            balances: BALANCES_TIMEOUT,
        }
    }
}

/// A wrapper around `reqwest::Client` which provides the subset of the standard beacon node API
/// needed to attribute rewards.
#[derive(Clone)]
pub struct BeaconNodeHttpClient {
    client: reqwest::Client,
    server: SensitiveUrl,
    timeouts: Timeouts,
    retry_policy: RetryPolicy,
}

impl fmt::Display for BeaconNodeHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.server.fmt(f)
    }
}

impl BeaconNodeHttpClient {
    pub fn new(server: SensitiveUrl, timeouts: Timeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
            timeouts,
            retry_policy: RetryPolicy::get(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    fn path(&self, segments: &[&str]) -> Result<Url, Error> {
        Ok(self.server.join_segments(segments)?)
    }

    /// Perform a HTTP GET request, returning `None` on a 404 error.
    async fn get_opt<T: DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
        method: &str,
    ) -> Result<Option<T>, Error> {
        metrics::inc_counter_vec(&metrics::CHAIN_CLIENT_REQUESTS, &[metrics::BEACON, method]);
        let request = self.client.get(url).timeout(timeout);
        let response = send_with_backoff(request, &self.retry_policy, metrics::BEACON).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
        method: &str,
    ) -> Result<T, Error> {
        let description = url.path().to_string();
        self.get_opt(url, timeout, method)
            .await?
            .ok_or(Error::NotFound(description))
    }

    /// `GET eth/v2/beacon/blocks/{slot}`
    ///
    /// Returns `Ok(None)` on a 404 error, which is how a missed slot is reported.
    pub async fn get_beacon_block(&self, slot: u64) -> Result<Option<BlockResponse>, Error> {
        let slot = slot.to_string();
        let url = self.path(&["eth", "v2", "beacon", "blocks", &slot])?;
        Ok(self
            .get_opt::<GenericResponse<BlockResponse>>(url, self.timeouts.default, "get_block")
            .await?
            .map(|response| response.data))
    }

    /// `GET eth/v1/beacon/states/{state_id}/validators?id=...`
    pub async fn get_validators(
        &self,
        state_id: &str,
        ids: &[String],
    ) -> Result<Vec<ValidatorSummary>, Error> {
        let mut validators = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_REQUEST) {
            let mut url = self.path(&["eth", "v1", "beacon", "states", state_id, "validators"])?;
            url.query_pairs_mut().append_pair("id", &chunk.join(","));
            let response: GenericResponse<Vec<ValidatorSummary>> = self
                .get(url, self.timeouts.default, "get_validators")
                .await?;
            validators.extend(response.data);
        }
        Ok(validators)
    }
}

#[async_trait]
impl BeaconClient for BeaconNodeHttpClient {
    async fn head_slot(&self) -> Result<u64, Error> {
        let url = self.path(&["eth", "v1", "beacon", "headers", "head"])?;
        let response: GenericResponse<HeaderResponse> =
            self.get(url, self.timeouts.default, "head_slot").await?;
        Ok(response.data.header.message.slot)
    }

    async fn finalized_epoch(&self) -> Result<u64, Error> {
        let url = self.path(&[
            "eth",
            "v1",
            "beacon",
            "states",
            "head",
            "finality_checkpoints",
        ])?;
        let response: GenericResponse<FinalityCheckpoints> = self
            .get(url, self.timeouts.default, "finality_checkpoints")
            .await?;
        Ok(response.data.finalized.epoch)
    }

    async fn get_slot_proposer_data(&self, slot: u64) -> Result<SlotProposerData, Error> {
        let Some(block) = self.get_beacon_block(slot).await? else {
            debug!("No block at slot {}", slot);
            return Ok(SlotProposerData::missed(slot));
        };

        let message = block.message;
        let payload = message.body.execution_payload;
        Ok(SlotProposerData {
            slot,
            proposer_index: Some(message.proposer_index),
            fee_recipient: payload.as_ref().map(|p| p.fee_recipient),
            block_number: payload.as_ref().map(|p| p.block_number),
            block_hash: payload.as_ref().map(|p| p.block_hash),
        })
    }

    async fn withdrawals_for_slot(&self, slot: u64) -> Result<Vec<Withdrawal>, Error> {
        let withdrawals = self
            .get_beacon_block(slot)
            .await?
            .and_then(|block| block.message.body.execution_payload)
            .map(|payload| payload.withdrawals)
            .unwrap_or_default();

        Ok(withdrawals
            .into_iter()
            .map(|withdrawal| Withdrawal { slot, ..withdrawal })
            .collect())
    }

    async fn balances_for_slot(
        &self,
        slot: u64,
        validator_indexes: Option<&[u64]>,
    ) -> Result<Vec<ValidatorBalance>, Error> {
        let slot = slot.to_string();
        let base = self.path(&["eth", "v1", "beacon", "states", &slot, "validator_balances"])?;

        let Some(indexes) = validator_indexes else {
            let response: GenericResponse<Vec<ValidatorBalance>> = self
                .get(base, self.timeouts.balances, "validator_balances")
                .await?;
            return Ok(response.data);
        };

        let mut balances = Vec::with_capacity(indexes.len());
        for chunk in indexes.chunks(MAX_IDS_PER_REQUEST) {
            let ids = chunk
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let mut url = base.clone();
            url.query_pairs_mut().append_pair("id", &ids);
            let response: GenericResponse<Vec<ValidatorBalance>> = self
                .get(url, self.timeouts.default, "validator_balances")
                .await?;
            balances.extend(response.data);
        }
        Ok(balances)
    }

    async fn activation_slots_for_validators(
        &self,
        validator_indexes: &[u64],
    ) -> Result<HashMap<u64, Option<u64>>, Error> {
        let ids = validator_indexes
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>();
        Ok(self
            .get_validators("head", &ids)
            .await?
            .into_iter()
            .map(|summary| {
                let epoch = summary.validator.activation_epoch;
                let slot = (epoch != FAR_FUTURE_EPOCH).then(|| epoch * SLOTS_PER_EPOCH);
                (summary.index, slot)
            })
            .collect())
    }

    async fn validator_indexes_for_pubkeys(
        &self,
        pubkeys: &[String],
    ) -> Result<HashMap<String, u64>, Error> {
        Ok(self
            .get_validators("head", pubkeys)
            .await?
            .into_iter()
            .map(|summary| (summary.validator.pubkey.to_lowercase(), summary.index))
            .collect())
    }
}
