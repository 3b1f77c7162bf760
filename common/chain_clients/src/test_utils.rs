//! In-memory implementations of the client traits, used to drive the indexer in tests.

use crate::types::*;
use crate::{BeaconClient, Error, ExecutionClient, RelayClient};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct BeaconState {
    head_slot: u64,
    finalized_epoch: u64,
    slots: HashMap<u64, SlotProposerData>,
    withdrawals: HashMap<u64, Vec<Withdrawal>>,
    balances: HashMap<u64, Vec<ValidatorBalance>>,
    activation_slots: HashMap<u64, Option<u64>>,
    pubkeys: HashMap<String, u64>,
    failing_slots: HashSet<u64>,
}

/// A beacon node whose chain is whatever the test puts into it. Slots without data are missed.
#[derive(Default)]
pub struct MockBeaconClient {
    state: Mutex<BeaconState>,
    finality_requests: AtomicUsize,
}

impl MockBeaconClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head_slot: u64, finalized_epoch: u64) {
        let mut state = self.state.lock();
        state.head_slot = head_slot;
        state.finalized_epoch = finalized_epoch;
    }

    pub fn add_slot(&self, data: SlotProposerData) {
        self.state.lock().slots.insert(data.slot, data);
    }

    pub fn add_withdrawal(&self, withdrawal: Withdrawal) {
        self.state
            .lock()
            .withdrawals
            .entry(withdrawal.slot)
            .or_default()
            .push(withdrawal);
    }

    pub fn set_balances(&self, slot: u64, balances: Vec<ValidatorBalance>) {
        self.state.lock().balances.insert(slot, balances);
    }

    pub fn set_activation_slot(&self, validator_index: u64, slot: Option<u64>) {
        self.state
            .lock()
            .activation_slots
            .insert(validator_index, slot);
    }

    pub fn add_pubkey(&self, pubkey: &str, validator_index: u64) {
        self.state
            .lock()
            .pubkeys
            .insert(pubkey.to_lowercase(), validator_index);
    }

    /// Requests for `slot` fail with a server error.
    pub fn fail_slot(&self, slot: u64) {
        self.state.lock().failing_slots.insert(slot);
    }

    pub fn finality_requests(&self) -> usize {
        self.finality_requests.load(Ordering::SeqCst)
    }

    fn check_slot(&self, slot: u64) -> Result<(), Error> {
        if self.state.lock().failing_slots.contains(&slot) {
            return Err(Error::StatusCode(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(())
    }
}

#[async_trait]
impl BeaconClient for MockBeaconClient {
    async fn head_slot(&self) -> Result<u64, Error> {
        Ok(self.state.lock().head_slot)
    }

    async fn finalized_epoch(&self) -> Result<u64, Error> {
        self.finality_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().finalized_epoch)
    }

    async fn get_slot_proposer_data(&self, slot: u64) -> Result<SlotProposerData, Error> {
        self.check_slot(slot)?;
        Ok(self
            .state
            .lock()
            .slots
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| SlotProposerData::missed(slot)))
    }

    async fn withdrawals_for_slot(&self, slot: u64) -> Result<Vec<Withdrawal>, Error> {
        self.check_slot(slot)?;
        Ok(self
            .state
            .lock()
            .withdrawals
            .get(&slot)
            .cloned()
            .unwrap_or_default())
    }

    async fn balances_for_slot(
        &self,
        slot: u64,
        validator_indexes: Option<&[u64]>,
    ) -> Result<Vec<ValidatorBalance>, Error> {
        let balances = self
            .state
            .lock()
            .balances
            .get(&slot)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("balances at slot {}", slot)))?;
        Ok(match validator_indexes {
            Some(indexes) => balances
                .into_iter()
                .filter(|b| indexes.contains(&b.validator_index))
                .collect(),
            None => balances,
        })
    }

    async fn activation_slots_for_validators(
        &self,
        validator_indexes: &[u64],
    ) -> Result<HashMap<u64, Option<u64>>, Error> {
        let state = self.state.lock();
        Ok(validator_indexes
            .iter()
            .filter_map(|i| state.activation_slots.get(i).map(|slot| (*i, *slot)))
            .collect())
    }

    async fn validator_indexes_for_pubkeys(
        &self,
        pubkeys: &[String],
    ) -> Result<HashMap<String, u64>, Error> {
        let state = self.state.lock();
        Ok(pubkeys
            .iter()
            .filter_map(|key| {
                let key = key.to_lowercase();
                state.pubkeys.get(&key).map(|index| (key, *index))
            })
            .collect())
    }
}

#[derive(Default)]
struct ExecutionState {
    block_number: u64,
    blocks: HashMap<u64, ExecutionBlock>,
    balances: HashMap<(Address, u64), Wei>,
    receipts: HashMap<B256, TransactionReceipt>,
    logs: Vec<Log>,
    calls: HashMap<(Address, Bytes, Option<u64>), Bytes>,
}

/// An archive node over a handful of hand-built blocks.
///
/// Unknown balances are zero. `eth_call`s without a registered answer revert.
#[derive(Default)]
pub struct MockExecutionClient {
    state: Mutex<ExecutionState>,
}

/// A transaction together with the fee its sender paid.
#[derive(Clone, Debug)]
pub struct MockTransaction {
    pub from: Address,
    pub to: Option<Address>,
    pub value: Wei,
    pub fee: Wei,
}

impl MockTransaction {
    pub fn new(from: Address, to: Option<Address>, value: Wei, fee: Wei) -> Self {
        Self {
            from,
            to,
            value,
            fee,
        }
    }
}

impl MockExecutionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block whose burnt fees are `burnt_fees` and whose transactions pay the given fees.
    pub fn add_block(
        &self,
        number: u64,
        miner: Address,
        extra_data: &[u8],
        burnt_fees: Wei,
        transactions: Vec<MockTransaction>,
    ) {
        let mut state = self.state.lock();
        let mut txs = Vec::with_capacity(transactions.len());
        for (i, tx) in transactions.into_iter().enumerate() {
            let mut hash_bytes = [0u8; 32];
            hash_bytes[..8].copy_from_slice(&number.to_be_bytes());
            hash_bytes[8..16].copy_from_slice(&(i as u64).to_be_bytes());
            let hash = B256::from(hash_bytes);

            state.receipts.insert(
                hash,
                TransactionReceipt {
                    transaction_hash: hash,
                    gas_used: U256::from(tx.fee as u128),
                    effective_gas_price: U256::from(1u64),
                },
            );
            txs.push(Transaction {
                hash,
                from: tx.from,
                to: tx.to,
                value: U256::from(tx.value as u128),
                transaction_index: Some(i as u64),
            });
        }

        let block = ExecutionBlock {
            number,
            hash: B256::from(U256::from(number)),
            miner,
            extra_data: Bytes::copy_from_slice(extra_data),
            base_fee_per_gas: Some(U256::from(burnt_fees as u128)),
            gas_used: U256::from(1u64),
            timestamp: 0,
            transactions: BlockTransactions::Full(txs),
        };
        state.block_number = state.block_number.max(number);
        state.blocks.insert(number, block);
    }

    pub fn set_balance(&self, address: Address, block_number: u64, balance: Wei) {
        self.state
            .lock()
            .balances
            .insert((address, block_number), balance);
    }

    pub fn add_log(&self, log: Log) {
        self.state.lock().logs.push(log);
    }

    pub fn set_call(&self, to: Address, data: Bytes, block_number: Option<u64>, result: Bytes) {
        self.state
            .lock()
            .calls
            .insert((to, data, block_number), result);
    }

    fn block(&self, block_number: u64) -> Result<ExecutionBlock, Error> {
        self.state
            .lock()
            .blocks
            .get(&block_number)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {}", block_number)))
    }
}

#[async_trait]
impl ExecutionClient for MockExecutionClient {
    async fn block_number(&self) -> Result<u64, Error> {
        Ok(self.state.lock().block_number)
    }

    async fn get_balance(&self, address: Address, block_number: u64) -> Result<Wei, Error> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&(address, block_number))
            .copied()
            .unwrap_or_default())
    }

    async fn get_block(&self, block_number: u64, verbose: bool) -> Result<ExecutionBlock, Error> {
        let mut block = self.block(block_number)?;
        if !verbose {
            block.transactions = BlockTransactions::Hashes(block.transaction_hashes());
        }
        Ok(block)
    }

    async fn get_block_tx_count(&self, block_number: u64) -> Result<u64, Error> {
        Ok(self.block(block_number)?.transaction_hashes().len() as u64)
    }

    async fn get_tx_data(&self, block_number: u64, tx_index: u64) -> Result<Transaction, Error> {
        self.block(block_number)?
            .transactions()
            .get(tx_index as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tx {} of block {}", tx_index, block_number)))
    }

    async fn get_tx_receipts(
        &self,
        tx_hashes: &[B256],
    ) -> Result<Vec<TransactionReceipt>, Error> {
        let state = self.state.lock();
        tx_hashes
            .iter()
            .map(|hash| {
                state
                    .receipts
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("receipt {}", hash)))
            })
            .collect()
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, Error> {
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|log| filter.matches(log))
            .cloned()
            .collect())
    }

    async fn eth_call(
        &self,
        to: Address,
        data: Bytes,
        block_number: Option<u64>,
    ) -> Result<Bytes, Error> {
        self.state
            .lock()
            .calls
            .get(&(to, data, block_number))
            .cloned()
            .ok_or(Error::ServerMessage {
                code: 3,
                message: "execution reverted".into(),
            })
    }
}

pub enum MockRelayResponse {
    Delivered(RelayPayload),
    NotDelivered,
    ServerError,
    /// An answer which cannot be decoded.
    Malformed,
}

/// A relay which answers after `delay`. Records whether its request ran to completion so tests
/// can observe cancellation.
pub struct MockRelayClient {
    name: String,
    response: MockRelayResponse,
    delay: Duration,
    requests: AtomicUsize,
    completed: AtomicBool,
}

impl MockRelayClient {
    pub fn new(name: &str, response: MockRelayResponse, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            response,
            delay,
            requests: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for MockRelayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_payload(&self, block_hash: B256) -> Result<Option<RelayPayload>, Error> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.store(true, Ordering::SeqCst);
        match &self.response {
            MockRelayResponse::Delivered(payload) if payload.block_hash == block_hash => {
                Ok(Some(payload.clone()))
            }
            MockRelayResponse::Delivered(_) | MockRelayResponse::NotDelivered => Ok(None),
            MockRelayResponse::ServerError => {
                Err(Error::StatusCode(StatusCode::SERVICE_UNAVAILABLE))
            }
            MockRelayResponse::Malformed => Err(Error::InvalidResponse(format!(
                "{} returned an unreadable payload",
                self.name
            ))),
        }
    }
}
