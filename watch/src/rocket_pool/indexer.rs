//! Discovers Rocket Pool nodes, minipools and bond reductions from the execution layer.

use super::fee_distributor::{call_with_address, decode_address, decode_uint};
use super::splitter::FULL_BOND_WEI;
use super::{parse_constant, BondReduction, Error, Minipool, RocketPoolNode};
use crate::metrics;
use crate::store::RewardStore;
use chain_clients::{Address, BeaconClient, Bytes, ExecutionClient, Log, LogFilter, Wei, B256};
use chrono::{TimeZone, Utc};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NODE_MANAGER_ADDRESS: &str = "0x89f478e6cc24f052103628f36598d4c14da3d287";
const NODE_DISTRIBUTOR_FACTORY_ADDRESS: &str = "0xe228017f77b3e0785e794e4c0a8a6b935bb4037c";
/// Every `RocketMinipoolManager` deployment, oldest first.
pub const MINIPOOL_MANAGER_ADDRESSES: [&str; 4] = [
    "0x6293b8abc1f36afb22406be5f96d893072a8cf3a",
    "0x84d11b65e026f7aa08f5497dd3593fb083410b71",
    "0x6d010c43d4e96d74c422f2e27370af48711b49bf",
    "0x09fbce43e4021a3f69c4599ff00362b83eda501e",
];

/// `MinipoolCreated(address indexed minipool, address indexed node, uint256 time)`
const MINIPOOL_CREATED_TOPIC: &str =
    "0x08b4b91bafaf992145c5dd7e098dfcdb32f879714c154c651c2758a44c7aeae4";
/// `BondReduced(uint256 previousBondAmount, uint256 newBondAmount, uint256 time)`
const BOND_REDUCED_TOPIC: &str =
    "0x90e131460b9acb17565f1719b9ebc49998aec6b07a4743a09b1b700545769eb6";

/// `getNodeAddresses(uint256,uint256)`
const GET_NODE_ADDRESSES: [u8; 4] = [0x2d, 0x7f, 0x21, 0xd0];
/// `getProxyAddress(address)`
const GET_PROXY_ADDRESS: [u8; 4] = [0xfa, 0x2a, 0x5b, 0x01];
/// `getNodeDepositBalance()`
const GET_NODE_DEPOSIT_BALANCE: [u8; 4] = [0x74, 0xca, 0x6b, 0xf2];
/// `getNodeFee()`
const GET_NODE_FEE: [u8; 4] = [0xe7, 0x15, 0x01, 0x34];
/// `getMinipoolPubkey(address)`
const GET_MINIPOOL_PUBKEY: [u8; 4] = [0x3e, 0xb5, 0x35, 0xe9];

const MAX_BLOCKS_PER_LOG_REQUEST: u64 = 100_000;
const PUBKEY_LENGTH: usize = 48;

/// Inclusive block ranges covering `from..=to`, each small enough for one `eth_getLogs` call.
fn block_chunks(from: u64, to: u64) -> impl Iterator<Item = (u64, u64)> {
    (from..=to)
        .step_by(MAX_BLOCKS_PER_LOG_REQUEST as usize)
        .map(move |start| (start, (start + MAX_BLOCKS_PER_LOG_REQUEST - 1).min(to)))
}

fn data_word(log: &Log, index: usize) -> Result<Wei, Error> {
    decode_uint(log.data.get(32 * index..).unwrap_or_default())
}

pub struct RocketPoolIndexer {
    beacon: Arc<dyn BeaconClient>,
    execution: Arc<dyn ExecutionClient>,
    store: Arc<dyn RewardStore>,
    /// Logs up to this block have been processed. Starts from genesis on every restart.
    last_block_indexed: AtomicU64,
}

impl RocketPoolIndexer {
    pub fn new(
        beacon: Arc<dyn BeaconClient>,
        execution: Arc<dyn ExecutionClient>,
        store: Arc<dyn RewardStore>,
    ) -> Self {
        Self {
            beacon,
            execution,
            store,
            last_block_indexed: AtomicU64::new(0),
        }
    }

    pub fn last_block_indexed(&self) -> u64 {
        self.last_block_indexed.load(Ordering::SeqCst)
    }

    pub async fn run(&self) -> Result<(), Error> {
        let current_block = self.execution.block_number().await?;
        let from_block = self.last_block_indexed();

        info!("Indexing Rocket Pool nodes");
        self.index_nodes(current_block).await?;

        info!("Indexing Rocket Pool minipools");
        let complete = self.index_minipools(from_block, current_block).await?;
        self.resolve_validator_indexes().await?;

        info!("Indexing Rocket Pool bond reductions");
        self.index_bond_reductions(from_block, current_block).await?;

        let minipools = self.store.minipools()?.len();
        metrics::set_gauge(&metrics::ROCKET_POOL_MINIPOOLS, minipools as i64);

        // Minipools which failed to load are retried from the same block next time.
        if complete {
            self.last_block_indexed
                .store(current_block + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn node_addresses(&self, block_number: u64) -> Result<Vec<Address>, Error> {
        let mut data = GET_NODE_ADDRESSES.to_vec();
        data.extend_from_slice(&[0u8; 64]);
        let result = self
            .execution
            .eth_call(
                parse_constant(NODE_MANAGER_ADDRESS)?,
                data.into(),
                Some(block_number),
            )
            .await?;

        // Offset and length of the returned array precede its elements.
        Ok(result
            .get(64..)
            .unwrap_or_default()
            .chunks_exact(32)
            .map(|word| Address::from_slice(&word[12..]))
            .collect())
    }

    async fn index_nodes(&self, block_number: u64) -> Result<(), Error> {
        let known: HashSet<Address> = self
            .store
            .rocket_pool_nodes()?
            .into_iter()
            .map(|node| node.address)
            .collect();
        let factory: Address = parse_constant(NODE_DISTRIBUTOR_FACTORY_ADDRESS)?;

        let mut count = 0;
        for address in self.node_addresses(block_number).await? {
            if known.contains(&address) {
                continue;
            }
            let result = self
                .execution
                .eth_call(factory, call_with_address(GET_PROXY_ADDRESS, address), None)
                .await?;
            let node = RocketPoolNode {
                address,
                fee_distributor: decode_address(&result, 0)?,
            };
            self.store.upsert_rocket_pool_node(&node)?;
            count += 1;
        }
        debug!("Stored {} new Rocket Pool nodes", count);
        Ok(())
    }

    /// Returns `false` if any newly created minipool could not be loaded.
    async fn index_minipools(&self, from_block: u64, to_block: u64) -> Result<bool, Error> {
        let known_nodes: HashSet<Address> = self
            .store
            .rocket_pool_nodes()?
            .into_iter()
            .map(|node| node.address)
            .collect();
        let mut known_minipools: HashSet<Address> = self
            .store
            .minipools()?
            .into_iter()
            .map(|minipool| minipool.address)
            .collect();
        let topic: B256 = parse_constant(MINIPOOL_CREATED_TOPIC)?;

        let mut complete = true;
        for manager in MINIPOOL_MANAGER_ADDRESSES {
            let manager: Address = parse_constant(manager)?;
            for (from, to) in block_chunks(from_block, to_block) {
                let filter = LogFilter {
                    address: Some(manager),
                    from_block: from,
                    to_block: to,
                    topics: vec![topic],
                };
                let logs = self.execution.get_logs(&filter).await?;
                debug!(
                    "Processing {} minipool creations of {} in blocks {}..={}",
                    logs.len(),
                    manager,
                    from,
                    to
                );

                for log in logs.iter().filter(|log| !log.removed) {
                    let (Some(minipool_topic), Some(node_topic)) =
                        (log.topics.get(1), log.topics.get(2))
                    else {
                        warn!("Malformed MinipoolCreated log from {}", log.address);
                        continue;
                    };
                    let address = Address::from_word(*minipool_topic);
                    let node_address = Address::from_word(*node_topic);

                    if known_minipools.contains(&address) {
                        debug!("Skipping {}, already known", address);
                        continue;
                    }
                    if !known_nodes.contains(&node_address) {
                        warn!(
                            "Skipping {}, its node address {} is not known yet",
                            address, node_address
                        );
                        continue;
                    }

                    match self.load_minipool(manager, address, node_address, log).await {
                        Ok(minipool) => {
                            self.store.upsert_minipool(&minipool)?;
                            known_minipools.insert(address);
                            info!("Stored minipool {} of node {}", address, node_address);
                        }
                        Err(e) => {
                            error!("Error processing minipool {}: {}", address, e);
                            complete = false;
                        }
                    }
                }
            }
        }
        Ok(complete)
    }

    async fn load_minipool(
        &self,
        manager: Address,
        address: Address,
        node_address: Address,
        log: &Log,
    ) -> Result<Minipool, Error> {
        let created_at = log.block_number.ok_or_else(|| {
            Error::InvalidMinipool(format!("creation log of {} has no block number", address))
        })?;

        let mut initial_bond_wei = decode_uint(
            &self
                .execution
                .eth_call(
                    address,
                    Bytes::from(GET_NODE_DEPOSIT_BALANCE.to_vec()),
                    Some(created_at),
                )
                .await?,
        )?;
        // Full deposits earned node rewards on 16 ETH and commission on the rest from the start.
        if initial_bond_wei == FULL_BOND_WEI {
            initial_bond_wei = FULL_BOND_WEI / 2;
        }

        let initial_fee = decode_uint(
            &self
                .execution
                .eth_call(address, Bytes::from(GET_NODE_FEE.to_vec()), Some(created_at))
                .await?,
        )?;
        if initial_fee <= 0 {
            return Err(Error::InvalidMinipool(format!(
                "minipool {} has fee {}",
                address, initial_fee
            )));
        }

        let result = self
            .execution
            .eth_call(manager, call_with_address(GET_MINIPOOL_PUBKEY, address), None)
            .await?;
        let pubkey = result
            .get(64..64 + PUBKEY_LENGTH)
            .map(|bytes| format!("0x{}", hex::encode(bytes)))
            .ok_or_else(|| {
                Error::InvalidCallResult(format!("no pubkey for minipool {}", address))
            })?;

        Ok(Minipool {
            address,
            node_address,
            pubkey: Some(pubkey),
            validator_index: None,
            initial_bond_wei,
            initial_fee,
            bond_reductions: vec![],
        })
    }

    /// Minipools get a validator index once their deposit is seen by the beacon chain.
    async fn resolve_validator_indexes(&self) -> Result<(), Error> {
        let unresolved: Vec<Minipool> = self
            .store
            .minipools()?
            .into_iter()
            .filter(|minipool| minipool.validator_index.is_none() && minipool.pubkey.is_some())
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }

        let pubkeys: Vec<String> = unresolved
            .iter()
            .filter_map(|minipool| minipool.pubkey.clone())
            .collect();
        let indexes = self.beacon.validator_indexes_for_pubkeys(&pubkeys).await?;

        for mut minipool in unresolved {
            let index = minipool
                .pubkey
                .as_ref()
                .and_then(|pubkey| indexes.get(&pubkey.to_lowercase()));
            if let Some(index) = index {
                minipool.validator_index = Some(*index);
                self.store.upsert_minipool(&minipool)?;
            }
        }
        Ok(())
    }

    async fn index_bond_reductions(&self, from_block: u64, to_block: u64) -> Result<(), Error> {
        let known_minipools: HashSet<Address> = self
            .store
            .minipools()?
            .into_iter()
            .map(|minipool| minipool.address)
            .collect();
        let topic: B256 = parse_constant(BOND_REDUCED_TOPIC)?;

        let mut count = 0;
        for (from, to) in block_chunks(from_block, to_block) {
            let filter = LogFilter {
                address: None,
                from_block: from,
                to_block: to,
                topics: vec![topic],
            };
            for log in self.execution.get_logs(&filter).await? {
                if log.removed || !known_minipools.contains(&log.address) {
                    continue;
                }
                let raw_timestamp = data_word(&log, 2)?;
                let timestamp = i64::try_from(raw_timestamp)
                    .ok()
                    .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
                    .ok_or_else(|| {
                        Error::InvalidMinipool(format!(
                            "bond reduction of {} at invalid time {}",
                            log.address, raw_timestamp
                        ))
                    })?;
                let block_number = log.block_number.ok_or_else(|| {
                    Error::InvalidMinipool(format!(
                        "bond reduction of {} without a block number",
                        log.address
                    ))
                })?;
                // State at the reduction block carries the new fee.
                let new_fee = decode_uint(
                    &self
                        .execution
                        .eth_call(
                            log.address,
                            Bytes::from(GET_NODE_FEE.to_vec()),
                            Some(block_number),
                        )
                        .await?,
                )?;
                if new_fee <= 0 {
                    return Err(Error::InvalidMinipool(format!(
                        "minipool {} has fee {} after its bond reduction",
                        log.address, new_fee
                    )));
                }
                let reduction = BondReduction {
                    minipool_address: log.address,
                    timestamp,
                    new_bond_wei: data_word(&log, 1)?,
                    new_fee,
                };
                self.store.insert_bond_reduction(&reduction)?;
                count += 1;
            }
        }
        debug!("Stored {} bond reductions", count);
        Ok(())
    }
}
