//! Clients for the chain data consumed by the rewards indexer:
//!
//! 1. A beacon node REST client (`BeaconNodeHttpClient`).
//! 2. An execution node JSON-RPC client (`ExecutionHttpClient`).
//! 3. MEV relay data API clients (`RelayHttpClient`).
//!
//! Each client is exposed through a trait so the indexer can be driven by the in-memory doubles in
//! `test_utils`. All HTTP requests go through `backoff::send_with_backoff`.

pub mod backoff;
pub mod beacon;
mod error;
pub mod execution;
pub mod metrics;
pub mod relay;
pub mod sensitive_url;
pub mod test_utils;
pub mod types;

pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use beacon::BeaconNodeHttpClient;
pub use error::Error;
pub use execution::ExecutionHttpClient;
pub use relay::RelayHttpClient;
pub use sensitive_url::{SensitiveError, SensitiveUrl};
pub use types::*;

use async_trait::async_trait;
use std::collections::HashMap;

/// Read access to a beacon node.
#[async_trait]
pub trait BeaconClient: Send + Sync {
    async fn head_slot(&self) -> Result<u64, Error>;

    /// Epoch of the head state's finalized checkpoint.
    async fn finalized_epoch(&self) -> Result<u64, Error>;

    /// A slot is final once the finalized checkpoint's epoch boundary is at or beyond it.
    async fn is_slot_finalized(&self, slot: u64) -> Result<bool, Error> {
        let finalized_epoch = self.finalized_epoch().await?;
        Ok(slot <= finalized_epoch.saturating_mul(SLOTS_PER_EPOCH))
    }

    /// Returns `SlotProposerData::missed` if there is no block at `slot`.
    async fn get_slot_proposer_data(&self, slot: u64) -> Result<SlotProposerData, Error>;

    async fn withdrawals_for_slot(&self, slot: u64) -> Result<Vec<Withdrawal>, Error>;

    /// Balances of `validator_indexes`, or of every validator if `None`.
    async fn balances_for_slot(
        &self,
        slot: u64,
        validator_indexes: Option<&[u64]>,
    ) -> Result<Vec<ValidatorBalance>, Error>;

    /// Maps each validator to its activation slot, or `None` if it is not active yet.
    async fn activation_slots_for_validators(
        &self,
        validator_indexes: &[u64],
    ) -> Result<HashMap<u64, Option<u64>>, Error>;

    /// Maps each known public key to its validator index. Unknown keys are omitted.
    async fn validator_indexes_for_pubkeys(
        &self,
        pubkeys: &[String],
    ) -> Result<HashMap<String, u64>, Error>;
}

/// Read access to an archive execution node.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, Error>;

    async fn get_balance(&self, address: Address, block_number: u64) -> Result<Wei, Error>;

    /// With `verbose`, the block contains full transaction objects instead of hashes.
    async fn get_block(&self, block_number: u64, verbose: bool) -> Result<ExecutionBlock, Error>;

    async fn get_block_tx_count(&self, block_number: u64) -> Result<u64, Error>;

    async fn get_tx_data(&self, block_number: u64, tx_index: u64) -> Result<Transaction, Error>;

    async fn get_tx_receipts(&self, tx_hashes: &[B256])
        -> Result<Vec<TransactionReceipt>, Error>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, Error>;

    /// `eth_call` against `to` at `block_number` (or the latest block).
    async fn eth_call(
        &self,
        to: Address,
        data: Bytes,
        block_number: Option<u64>,
    ) -> Result<Bytes, Error>;

    async fn get_tx_fee(&self, tx_hash: B256) -> Result<Wei, Error> {
        let receipts = self.get_tx_receipts(&[tx_hash]).await?;
        receipts
            .first()
            .ok_or_else(|| Error::NotFound(format!("receipt of {}", tx_hash)))?
            .fee()
    }

    async fn get_burnt_tx_fees_for_block(&self, block_number: u64) -> Result<Wei, Error> {
        self.get_block(block_number, false).await?.burnt_fees()
    }

    /// Coinbase, extra data and the total fees paid by the block's transactions.
    async fn get_miner_data(&self, block_number: u64) -> Result<MinerData, Error> {
        let block = self.get_block(block_number, false).await?;
        let hashes = block.transaction_hashes();
        let mut tx_fee: Wei = 0;
        if !hashes.is_empty() {
            for receipt in self.get_tx_receipts(&hashes).await? {
                tx_fee += receipt.fee()?;
            }
        }
        Ok(MinerData {
            tx_fee,
            coinbase: block.miner,
            extra_data: block.extra_data,
        })
    }

    /// Priority fees are the transaction fees minus the burnt base fee.
    async fn get_block_priority_tx_fees(
        &self,
        block_number: u64,
        tx_fees_total: Wei,
    ) -> Result<Wei, Error> {
        Ok(tx_fees_total - self.get_burnt_tx_fees_for_block(block_number).await?)
    }
}

/// Read access to the data API of one MEV relay.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// The payload delivered for `block_hash`, or `None` if this relay did not deliver it.
    async fn get_payload(&self, block_hash: B256) -> Result<Option<RelayPayload>, Error>;
}
