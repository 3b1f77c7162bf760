//! Decoders for the reward distribution events of contracts which are commonly used as fee
//! recipients.
//!
//! When such a contract pays out its accumulated rewards in the same block it receives a block
//! reward, its balance delta is reduced by the distributed amount. Each protocol emits the
//! distributed amount in its own event layout.

use chain_clients::{
    u256_to_wei, Address, Error, ExecutionClient, Log, LogFilter, Wei, B256, U256,
};
use std::collections::HashMap;
use std::sync::Arc;

const WORD: usize = 32;

/// Rocket Pool node fee distributors observed as fee recipients.
pub const ROCKET_POOL_DISTRIBUTORS: &[&str] = &[
    "0x83d18f201f7fa5d9602ff1a446b212a2d74f2a28",
    "0x34f4261360d0372176d1d521bf99bf803ced4f6b",
];
/// `DistributeRewards(address,address,uint256,uint256,uint256)` of `RocketNodeDistributorDelegate`.
pub const ROCKET_POOL_DISTRIBUTED_TOPIC: &str =
    "0x4c41dd034da8150bccdeba2e484837eb447e0a3840b3e02a54e9bd6eb883210e";

pub const LIDO_EXECUTION_LAYER_REWARDS_VAULT: &str = "0x388c818ca8b9251b393131c08a736a67ccb19297";
/// The stETH token, which emits `ELRewardsReceived(uint256)` when it pulls from the vault.
pub const LIDO_STETH: &str = "0xae7ab96520de3a18e5e111b5eaab095312d7fe84";
pub const LIDO_EL_REWARDS_RECEIVED_TOPIC: &str =
    "0xd27f9b0c98bdee27044afa149eadcd2047d6399cb6613a45c5b87e6aca76e6b5";

pub const STAKEFISH_FEE_POOLS: &[&str] = &[
    "0x54cd0e6771b6487c721ec620c4de1240d3b07696",
    "0xffee087852cb4898e6c3532e776e68bc68b1143b",
];
pub const STAKEFISH_DISTRIBUTED_TOPIC: &str =
    "0x7916d844d976746a43b9efc42cf4339ebe50001364a8790d4aec7bbd9a2b599e";

pub const KRAKEN_FEE_RECIPIENTS: &[&str] = &[
    "0xdf50d17985f28c9396a2bc19c8784d838fac958f",
    "0xc9e30152fdb48b6535a1cd4cbbd78349b36afd21",
    "0x036d539e2f1ba71ef2e8dec66ca0ffeae9e15f17",
    "0xbd28c94ff48f9c9c1abbf2691b1c5523c5c7a7a8",
    "0x6b9c23e50d6d5c2854cff4d305f279ad4007ec1e",
    "0xdfa1119cbfd974810276d88ae3e5c2ff360b85e0",
];
pub const KRAKEN_DISTRIBUTED_TOPIC: &str =
    "0x1bb9fb49058794ee4e0f88f3c95c10019922d0b1c6f27da1ee2a98ad19d9b308";

/// The `index`th 32 byte word of `data`.
pub fn data_word(data: &[u8], index: usize) -> Result<U256, Error> {
    let start = index * WORD;
    data.get(start..start + WORD)
        .map(U256::from_be_slice)
        .ok_or_else(|| {
            Error::InvalidResponse(format!(
                "log data of {} bytes has no word {}",
                data.len(),
                index
            ))
        })
}

/// `data` interpreted as one big-endian integer.
pub fn data_as_integer(data: &[u8]) -> Result<U256, Error> {
    U256::try_from_be_slice(data).ok_or_else(|| {
        Error::InvalidResponse(format!("log data of {} bytes exceeds 256 bits", data.len()))
    })
}

fn parse_address(s: &str) -> Result<Address, Error> {
    s.parse()
        .map_err(|e| Error::InvalidResponse(format!("invalid address {}: {:?}", s, e)))
}

fn parse_topic(s: &str) -> Result<B256, Error> {
    s.parse()
        .map_err(|e| Error::InvalidResponse(format!("invalid topic {}: {:?}", s, e)))
}

/// The decoding rule of one protocol's distribution event.
pub trait RewardDistributor: Send + Sync {
    fn name(&self) -> &'static str;

    /// The logs which report distributions made by `recipient` in `block_number`.
    fn log_filter(&self, recipient: Address, block_number: u64) -> LogFilter;

    /// The amount paid out according to one (non-removed) log.
    fn distributed_value(&self, log: &Log) -> Result<Wei, Error>;
}

/// Rocket Pool reports the node share and the user share of a distribution in two words.
pub struct RocketPoolDistributor {
    topic: B256,
}

impl RewardDistributor for RocketPoolDistributor {
    fn name(&self) -> &'static str {
        "rocket_pool"
    }

    fn log_filter(&self, recipient: Address, block_number: u64) -> LogFilter {
        LogFilter::single_block(Some(recipient), block_number, self.topic)
    }

    fn distributed_value(&self, log: &Log) -> Result<Wei, Error> {
        Ok(u256_to_wei(data_word(&log.data, 1)?)? + u256_to_wei(data_word(&log.data, 2)?)?)
    }
}

/// Lido's vault does not log anything itself. The stETH contract logs what it withdrew from it.
pub struct LidoDistributor {
    steth: Address,
    topic: B256,
}

impl RewardDistributor for LidoDistributor {
    fn name(&self) -> &'static str {
        "lido"
    }

    fn log_filter(&self, _recipient: Address, block_number: u64) -> LogFilter {
        LogFilter::single_block(Some(self.steth), block_number, self.topic)
    }

    fn distributed_value(&self, log: &Log) -> Result<Wei, Error> {
        u256_to_wei(data_as_integer(&log.data)?)
    }
}

pub struct StakefishDistributor {
    topic: B256,
}

impl RewardDistributor for StakefishDistributor {
    fn name(&self) -> &'static str {
        "stakefish"
    }

    fn log_filter(&self, recipient: Address, block_number: u64) -> LogFilter {
        LogFilter::single_block(Some(recipient), block_number, self.topic)
    }

    fn distributed_value(&self, log: &Log) -> Result<Wei, Error> {
        u256_to_wei(data_word(&log.data, 1)?)
    }
}

pub struct KrakenDistributor {
    topic: B256,
}

impl RewardDistributor for KrakenDistributor {
    fn name(&self) -> &'static str {
        "kraken"
    }

    fn log_filter(&self, recipient: Address, block_number: u64) -> LogFilter {
        LogFilter::single_block(Some(recipient), block_number, self.topic)
    }

    fn distributed_value(&self, log: &Log) -> Result<Wei, Error> {
        u256_to_wei(data_as_integer(&log.data)?)
    }
}

/// Distribution decoders keyed by the fee recipient they apply to.
#[derive(Clone, Default)]
pub struct Distributors {
    by_address: HashMap<Address, Arc<dyn RewardDistributor>>,
}

impl Distributors {
    pub fn mainnet() -> Result<Self, Error> {
        let mut distributors = Self::default();

        let rocket_pool: Arc<dyn RewardDistributor> = Arc::new(RocketPoolDistributor {
            topic: parse_topic(ROCKET_POOL_DISTRIBUTED_TOPIC)?,
        });
        for address in ROCKET_POOL_DISTRIBUTORS {
            distributors.insert(parse_address(address)?, rocket_pool.clone());
        }

        distributors.insert(
            parse_address(LIDO_EXECUTION_LAYER_REWARDS_VAULT)?,
            Arc::new(LidoDistributor {
                steth: parse_address(LIDO_STETH)?,
                topic: parse_topic(LIDO_EL_REWARDS_RECEIVED_TOPIC)?,
            }),
        );

        let stakefish: Arc<dyn RewardDistributor> = Arc::new(StakefishDistributor {
            topic: parse_topic(STAKEFISH_DISTRIBUTED_TOPIC)?,
        });
        for address in STAKEFISH_FEE_POOLS {
            distributors.insert(parse_address(address)?, stakefish.clone());
        }

        let kraken: Arc<dyn RewardDistributor> = Arc::new(KrakenDistributor {
            topic: parse_topic(KRAKEN_DISTRIBUTED_TOPIC)?,
        });
        for address in KRAKEN_FEE_RECIPIENTS {
            distributors.insert(parse_address(address)?, kraken.clone());
        }

        Ok(distributors)
    }

    pub fn insert(&mut self, address: Address, distributor: Arc<dyn RewardDistributor>) {
        self.by_address.insert(address, distributor);
    }

    pub fn get(&self, address: &Address) -> Option<&Arc<dyn RewardDistributor>> {
        self.by_address.get(address)
    }

    /// Total value distributed by `address` in `block_number`, or zero if `address` is not a
    /// known distributor.
    pub async fn distributed_value(
        &self,
        execution: &dyn ExecutionClient,
        address: Address,
        block_number: u64,
    ) -> Result<Wei, Error> {
        let Some(distributor) = self.get(&address) else {
            return Ok(0);
        };

        let logs = execution
            .get_logs(&distributor.log_filter(address, block_number))
            .await?;
        let mut value: Wei = 0;
        for log in logs.iter().filter(|log| !log.removed) {
            value += distributor.distributed_value(log)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_clients::test_utils::MockExecutionClient;
    use chain_clients::Bytes;

    fn words(values: &[u64]) -> Bytes {
        let mut data = vec![];
        for value in values {
            data.extend_from_slice(&U256::from(*value).to_be_bytes::<32>());
        }
        data.into()
    }

    fn log(address: Address, topic: &str, data: Bytes, block_number: u64, removed: bool) -> Log {
        Log {
            address,
            topics: vec![topic.parse().unwrap()],
            data,
            block_number: Some(block_number),
            removed,
        }
    }

    #[test]
    fn data_words() {
        let data = words(&[1, 2, 3]);
        assert_eq!(data_word(&data, 1).unwrap(), U256::from(2u64));
        assert!(data_word(&data, 3).is_err());
        assert_eq!(data_as_integer(&words(&[7])).unwrap(), U256::from(7u64));
        assert!(data_as_integer(&data).is_err());
    }

    #[tokio::test]
    async fn rocket_pool_sums_node_and_user_shares() {
        let distributors = Distributors::mainnet().unwrap();
        let execution = MockExecutionClient::new();
        let address = parse_address(ROCKET_POOL_DISTRIBUTORS[0]).unwrap();
        execution.add_log(log(
            address,
            ROCKET_POOL_DISTRIBUTED_TOPIC,
            words(&[99, 300, 700]),
            100,
            false,
        ));
        // Ignored: removed by a reorg, other block, other topic.
        execution.add_log(log(
            address,
            ROCKET_POOL_DISTRIBUTED_TOPIC,
            words(&[0, 5, 5]),
            100,
            true,
        ));
        execution.add_log(log(
            address,
            ROCKET_POOL_DISTRIBUTED_TOPIC,
            words(&[0, 5, 5]),
            101,
            false,
        ));
        execution.add_log(log(address, KRAKEN_DISTRIBUTED_TOPIC, words(&[5]), 100, false));

        assert_eq!(
            distributors
                .distributed_value(&execution, address, 100)
                .await
                .unwrap(),
            1_000
        );
    }

    #[tokio::test]
    async fn lido_reads_steth_logs() {
        let distributors = Distributors::mainnet().unwrap();
        let execution = MockExecutionClient::new();
        let vault = parse_address(LIDO_EXECUTION_LAYER_REWARDS_VAULT).unwrap();
        let steth = parse_address(LIDO_STETH).unwrap();
        execution.add_log(log(
            steth,
            LIDO_EL_REWARDS_RECEIVED_TOPIC,
            words(&[42]),
            7,
            false,
        ));
        assert_eq!(
            distributors
                .distributed_value(&execution, vault, 7)
                .await
                .unwrap(),
            42
        );
    }

    #[tokio::test]
    async fn stakefish_and_kraken_layouts() {
        let distributors = Distributors::mainnet().unwrap();
        let execution = MockExecutionClient::new();
        let stakefish = parse_address(STAKEFISH_FEE_POOLS[1]).unwrap();
        let kraken = parse_address(KRAKEN_FEE_RECIPIENTS[2]).unwrap();
        execution.add_log(log(
            stakefish,
            STAKEFISH_DISTRIBUTED_TOPIC,
            words(&[1, 11, 111]),
            3,
            false,
        ));
        execution.add_log(log(kraken, KRAKEN_DISTRIBUTED_TOPIC, words(&[13]), 3, false));

        assert_eq!(
            distributors
                .distributed_value(&execution, stakefish, 3)
                .await
                .unwrap(),
            11
        );
        assert_eq!(
            distributors
                .distributed_value(&execution, kraken, 3)
                .await
                .unwrap(),
            13
        );
        assert_eq!(
            distributors
                .distributed_value(&execution, Address::repeat_byte(9), 3)
                .await
                .unwrap(),
            0
        );
    }
}
