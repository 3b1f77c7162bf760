//! Per-validator reward totals over a range of UTC days.
//!
//! Aggregation only reads indexed data. A request fails as a whole when any block reward it would
//! use could not be classified, since answering with a partial total would under-report.

use crate::consensus_rewards::daily_consensus_rewards;
use crate::database;
use crate::rocket_pool::{
    self, node_share_of_block_reward, reward_share_for_withdrawal, RocketPoolNode,
    SMOOTHING_POOL_ADDRESS,
};
use crate::store::RewardStore;
use crate::types::{
    date_for_slot, end_of_day_slot, slot_for_datetime, BlockRewardRecord, RewardForDate,
};
use chain_clients::{Address, BeaconClient, ExecutionClient, Wei, Withdrawal};
use chrono::{NaiveDate, NaiveTime};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum Error {
    /// The requested dates do not cover at least one complete day.
    InvalidRange(String),
    /// Block rewards in range were not classified. `validator_index` is `None` for slots whose
    /// proposer is unknown.
    MissingBlockRewards {
        validator_index: Option<u64>,
        slots: Vec<u64>,
    },
    /// The balance anchoring the first day of the range has not been indexed.
    MissingBalance { validator_index: u64, slot: u64 },
    Database(database::Error),
    Client(chain_clients::Error),
    RocketPool(rocket_pool::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<database::Error> for Error {
    fn from(e: database::Error) -> Self {
        Error::Database(e)
    }
}

impl From<chain_clients::Error> for Error {
    fn from(e: chain_clients::Error) -> Self {
        Error::Client(e)
    }
}

impl From<rocket_pool::Error> for Error {
    fn from(e: rocket_pool::Error) -> Self {
        Error::RocketPool(e)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardsRequest {
    pub validator_indexes: Vec<u64>,
    pub start_date: NaiveDate,
    /// Exclusive. Capped to the last complete day.
    pub end_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocketPoolRewards {
    pub minipool_address: Address,
    pub node_address: Address,
    /// Node operator share of each day's withdrawals.
    pub withdrawals: Vec<RewardForDate>,
    /// Node operator share of the execution layer rewards of the validator's proposals.
    pub execution_layer_rewards: Vec<RewardForDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRewards {
    pub validator_index: u64,
    pub consensus_layer_rewards: Vec<RewardForDate>,
    pub execution_layer_rewards: Vec<RewardForDate>,
    pub withdrawals: Vec<RewardForDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rocket_pool: Option<RocketPoolRewards>,
}

impl ValidatorRewards {
    fn empty(validator_index: u64) -> Self {
        Self {
            validator_index,
            consensus_layer_rewards: vec![],
            execution_layer_rewards: vec![],
            withdrawals: vec![],
            rocket_pool: None,
        }
    }
}

/// The slots covered by a request: from the start of `start_date` to the last slot of the day
/// before `end_date`, plus the end-of-day slot anchoring the first day's balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub anchor_slot: u64,
    pub min_slot: u64,
    pub max_slot: u64,
}

impl SlotRange {
    /// Validates the request dates against `today`. `end_date` is exclusive and moved back to
    /// `today` if it lies further in the future.
    pub fn for_dates(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> Result<Self, Error> {
        if end <= start {
            return Err(Error::InvalidRange(format!(
                "end date {} must be after start date {}",
                end, start
            )));
        }
        let end = end.min(today);
        let last_day = end
            .pred_opt()
            .filter(|last| *last >= start)
            .ok_or_else(|| {
                Error::InvalidRange(format!("no complete day between {} and {}", start, end))
            })?;

        Ok(Self {
            anchor_slot: start.pred_opt().map_or(0, end_of_day_slot),
            min_slot: slot_for_datetime(start.and_time(NaiveTime::MIN).and_utc()),
            max_slot: end_of_day_slot(last_day),
        })
    }
}

/// Block rewards which could not be classified, grouped by proposer.
pub fn missing_block_rewards(
    store: &dyn RewardStore,
) -> Result<BTreeMap<Option<u64>, Vec<u64>>, Error> {
    let mut missing: BTreeMap<Option<u64>, Vec<u64>> = BTreeMap::new();
    for record in store.failed_block_rewards()? {
        missing
            .entry(record.proposer_index)
            .or_default()
            .push(record.slot);
    }
    Ok(missing)
}

/// Sums `rewards` per date, ordered by date.
fn sum_by_date(rewards: impl IntoIterator<Item = RewardForDate>) -> Vec<RewardForDate> {
    let mut totals: BTreeMap<NaiveDate, Wei> = BTreeMap::new();
    for reward in rewards {
        *totals.entry(reward.date).or_default() += reward.amount_wei;
    }
    totals
        .into_iter()
        .map(|(date, amount_wei)| RewardForDate { date, amount_wei })
        .collect()
}

pub struct RewardAggregator {
    store: Arc<dyn RewardStore>,
    beacon: Arc<dyn BeaconClient>,
    execution: Arc<dyn ExecutionClient>,
}

impl RewardAggregator {
    pub fn new(
        store: Arc<dyn RewardStore>,
        beacon: Arc<dyn BeaconClient>,
        execution: Arc<dyn ExecutionClient>,
    ) -> Self {
        Self {
            store,
            beacon,
            execution,
        }
    }

    /// Rewards of every requested validator, in ascending validator index order. Validators which
    /// are not active yet get empty reward series.
    pub async fn validator_rewards(
        &self,
        request: &RewardsRequest,
        today: NaiveDate,
    ) -> Result<Vec<ValidatorRewards>, Error> {
        let range = SlotRange::for_dates(request.start_date, request.end_date, today)?;
        let indexes: Vec<u64> = request
            .validator_indexes
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.check_block_rewards(&indexes, range)?;

        let activation_slots = self
            .beacon
            .activation_slots_for_validators(&indexes)
            .await?;
        let balances = self
            .store
            .balances(&indexes, range.anchor_slot, range.max_slot)?;
        let withdrawals = self.store.withdrawals_for_validators(
            &indexes,
            range.anchor_slot + 1,
            range.max_slot,
        )?;
        let block_rewards = self
            .store
            .block_rewards_in_range(range.min_slot, range.max_slot, &indexes)?;

        let mut results = Vec::with_capacity(indexes.len());
        for validator_index in indexes {
            let Some(activation_slot) = activation_slots.get(&validator_index).copied().flatten()
            else {
                debug!("Validator {} is not active yet", validator_index);
                results.push(ValidatorRewards::empty(validator_index));
                continue;
            };

            let anchored = activation_slot > range.anchor_slot
                || balances.iter().any(|b| {
                    b.validator_index == validator_index && b.slot == range.anchor_slot
                });
            if !anchored {
                return Err(Error::MissingBalance {
                    validator_index,
                    slot: range.anchor_slot,
                });
            }

            let validator_withdrawals: Vec<Withdrawal> = withdrawals
                .iter()
                .filter(|w| w.validator_index == validator_index)
                .cloned()
                .collect();
            let proposals: Vec<_> = block_rewards
                .iter()
                .filter(|r| r.proposer_index == Some(validator_index))
                .collect();

            let rocket_pool = match self.store.minipool_for_validator(validator_index)? {
                Some(minipool) => {
                    let node = self.store.rocket_pool_node(minipool.node_address)?;
                    let mut execution_layer_rewards = vec![];
                    for record in &proposals {
                        if let Some(share) =
                            self.node_share_of_proposal(record, node.as_ref()).await?
                        {
                            execution_layer_rewards.push(share);
                        }
                    }
                    Some(RocketPoolRewards {
                        minipool_address: minipool.address,
                        node_address: minipool.node_address,
                        withdrawals: sum_by_date(
                            validator_withdrawals
                                .iter()
                                .map(|w| reward_share_for_withdrawal(w, &minipool)),
                        ),
                        execution_layer_rewards: sum_by_date(execution_layer_rewards),
                    })
                }
                None => None,
            };

            results.push(ValidatorRewards {
                validator_index,
                consensus_layer_rewards: daily_consensus_rewards(
                    validator_index,
                    activation_slot,
                    &balances,
                    &validator_withdrawals,
                ),
                execution_layer_rewards: sum_by_date(proposals.iter().map(|r| RewardForDate {
                    date: date_for_slot(r.slot),
                    amount_wei: r.execution_reward(),
                })),
                withdrawals: sum_by_date(validator_withdrawals.iter().map(|w| RewardForDate {
                    date: date_for_slot(w.slot),
                    amount_wei: w.amount_wei(),
                })),
                rocket_pool,
            });
        }
        Ok(results)
    }

    /// Fails if a block reward in range is unresolved and was proposed by one of `indexes` or by
    /// an unknown proposer.
    fn check_block_rewards(&self, indexes: &[u64], range: SlotRange) -> Result<(), Error> {
        let mut missing: HashMap<Option<u64>, Vec<u64>> = HashMap::new();
        for record in self.store.failed_block_rewards()? {
            if record.slot < range.min_slot || record.slot > range.max_slot {
                continue;
            }
            let relevant = match record.proposer_index {
                Some(proposer) => indexes.contains(&proposer),
                None => true,
            };
            if relevant {
                missing
                    .entry(record.proposer_index)
                    .or_default()
                    .push(record.slot);
            }
        }

        match missing.into_iter().min_by_key(|(proposer, _)| *proposer) {
            Some((validator_index, slots)) => Err(Error::MissingBlockRewards {
                validator_index,
                slots,
            }),
            None => Ok(()),
        }
    }

    /// The node operator's share of one proposal. Rewards paid to the smoothing pool are not
    /// attributed to single proposals.
    async fn node_share_of_proposal(
        &self,
        record: &BlockRewardRecord,
        node: Option<&RocketPoolNode>,
    ) -> Result<Option<RewardForDate>, Error> {
        let (Some(recipient), Some(block_number)) = (record.reward_recipient(), record.block_number)
        else {
            return Ok(None);
        };
        let smoothing_pool: Address = rocket_pool::parse_constant(SMOOTHING_POOL_ADDRESS)?;
        if recipient == smoothing_pool {
            return Ok(None);
        }

        let amount_wei = match node {
            Some(node) if node.fee_distributor == recipient => {
                debug!(
                    "Splitting the reward of slot {} paid to distributor {}",
                    record.slot, recipient
                );
                node_share_of_block_reward(
                    self.execution.as_ref(),
                    node.fee_distributor,
                    node.address,
                    block_number,
                )
                .await?
            }
            _ => record.execution_reward(),
        };
        Ok(Some(RewardForDate {
            date: date_for_slot(record.slot),
            amount_wei,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rocket_pool::Minipool;
    use crate::store::MemoryStore;
    use crate::types::BalanceSnapshot;
    use chain_clients::test_utils::{MockBeaconClient, MockExecutionClient};
    use chain_clients::{WEI_PER_ETH, WEI_PER_GWEI};

    const VALIDATOR: u64 = 9;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 6, d).unwrap()
    }

    fn eod(d: u32) -> u64 {
        end_of_day_slot(day(d))
    }

    fn proposal(slot: u64, priority_fees_wei: Wei) -> BlockRewardRecord {
        BlockRewardRecord {
            block_number: Some(slot + 1_000),
            proposer_index: Some(VALIDATOR),
            fee_recipient: Some(Address::repeat_byte(0x11)),
            priority_fees_wei: Some(priority_fees_wei),
            mev: Some(false),
            ..BlockRewardRecord::missed(slot)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        beacon: Arc<MockBeaconClient>,
        aggregator: RewardAggregator,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let beacon = Arc::new(MockBeaconClient::new());
            let aggregator = RewardAggregator::new(
                store.clone(),
                beacon.clone(),
                Arc::new(MockExecutionClient::new()),
            );
            beacon.set_activation_slot(VALIDATOR, Some(0));
            let anchor = end_of_day_slot(NaiveDate::from_ymd_opt(2023, 5, 31).unwrap());
            let balances: Vec<BalanceSnapshot> = [
                (anchor, 32_000_000_000),
                (eod(1), 32_000_010_000),
                (eod(2), 32_000_015_000),
            ]
            .into_iter()
            .map(|(slot, balance_gwei)| BalanceSnapshot {
                slot,
                validator_index: VALIDATOR,
                balance_gwei,
            })
            .collect();
            store.insert_balances(&balances).unwrap();
            Self {
                store,
                beacon,
                aggregator,
            }
        }

        async fn rewards(&self) -> Result<Vec<ValidatorRewards>, Error> {
            let request = RewardsRequest {
                validator_indexes: vec![VALIDATOR, VALIDATOR],
                start_date: day(1),
                end_date: day(3),
            };
            self.aggregator.validator_rewards(&request, day(20)).await
        }
    }

    #[test]
    fn ranges_cover_complete_days_only() {
        assert!(matches!(
            SlotRange::for_dates(day(5), day(5), day(20)),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            SlotRange::for_dates(day(3), day(6), day(3)),
            Err(Error::InvalidRange(_))
        ));

        let range = SlotRange::for_dates(day(1), day(30), day(3)).unwrap();
        assert_eq!(range.max_slot, eod(2));
        assert_eq!(
            range.anchor_slot,
            end_of_day_slot(NaiveDate::from_ymd_opt(2023, 5, 31).unwrap())
        );
        assert_eq!(range.min_slot, range.anchor_slot + 1);
    }

    #[tokio::test]
    async fn sums_rewards_per_day() {
        let harness = Harness::new();
        harness
            .store
            .insert_withdrawals(&[Withdrawal {
                slot: eod(1) + 10,
                validator_index: VALIDATOR,
                address: Address::repeat_byte(0x22),
                amount_gwei: 5_000,
            }])
            .unwrap();
        harness
            .store
            .upsert_block_reward(&proposal(eod(1) - 100, 7))
            .unwrap();
        harness
            .store
            .upsert_block_reward(&proposal(eod(2) - 100, 3))
            .unwrap();
        harness
            .store
            .upsert_block_reward(&BlockRewardRecord {
                mev: Some(true),
                mev_reward_recipient: Some(Address::repeat_byte(0x33)),
                mev_reward_value_wei: Some(100),
                ..proposal(eod(2) - 50, 1)
            })
            .unwrap();
        // Out of range.
        harness
            .store
            .upsert_block_reward(&proposal(eod(3) - 50, 1_000))
            .unwrap();

        let rewards = harness.rewards().await.unwrap();
        assert_eq!(rewards.len(), 1);
        let rewards = &rewards[0];
        let reward = |d, amount_wei| RewardForDate {
            date: day(d),
            amount_wei,
        };
        assert_eq!(
            rewards.consensus_layer_rewards,
            vec![
                reward(1, 10_000 * WEI_PER_GWEI),
                reward(2, 10_000 * WEI_PER_GWEI)
            ]
        );
        assert_eq!(
            rewards.execution_layer_rewards,
            vec![reward(1, 7), reward(2, 103)]
        );
        assert_eq!(rewards.withdrawals, vec![reward(2, 5_000 * WEI_PER_GWEI)]);
        assert_eq!(rewards.rocket_pool, None);
    }

    #[tokio::test]
    async fn unresolved_block_rewards_fail_the_request() {
        let harness = Harness::new();
        let failed = BlockRewardRecord {
            processed_ok: false,
            ..proposal(eod(2) - 10, 0)
        };
        harness.store.upsert_block_reward(&failed).unwrap();

        match harness.rewards().await {
            Err(Error::MissingBlockRewards {
                validator_index,
                slots,
            }) => {
                assert_eq!(validator_index, Some(VALIDATOR));
                assert_eq!(slots, vec![failed.slot]);
            }
            other => panic!("unexpected result {:?}", other),
        }

        // Resolved on a later run.
        harness
            .store
            .upsert_block_reward(&proposal(failed.slot, 5))
            .unwrap();
        assert!(harness.rewards().await.is_ok());

        // Another validator's failure does not matter, an unknown proposer's does.
        let mut other = BlockRewardRecord {
            processed_ok: false,
            ..proposal(eod(1), 0)
        };
        other.proposer_index = Some(VALIDATOR + 1);
        harness.store.upsert_block_reward(&other).unwrap();
        assert!(harness.rewards().await.is_ok());

        let unknown = BlockRewardRecord {
            processed_ok: false,
            ..BlockRewardRecord::missed(eod(1) - 1)
        };
        harness.store.upsert_block_reward(&unknown).unwrap();
        assert!(matches!(
            harness.rewards().await,
            Err(Error::MissingBlockRewards {
                validator_index: None,
                ..
            })
        ));
        assert_eq!(
            missing_block_rewards(harness.store.as_ref()).unwrap(),
            BTreeMap::from([
                (None, vec![unknown.slot]),
                (Some(VALIDATOR + 1), vec![other.slot])
            ])
        );
    }

    #[tokio::test]
    async fn pending_validators_have_no_rewards() {
        let harness = Harness::new();
        harness.beacon.set_activation_slot(VALIDATOR, None);
        assert_eq!(
            harness.rewards().await.unwrap(),
            vec![ValidatorRewards::empty(VALIDATOR)]
        );
    }

    #[tokio::test]
    async fn missing_anchor_balance_is_an_error() {
        let harness = Harness::new();
        let request = RewardsRequest {
            validator_indexes: vec![VALIDATOR],
            start_date: day(2),
            end_date: day(3),
        };
        // The anchor of day 2 is the day 1 snapshot, which exists.
        assert!(harness
            .aggregator
            .validator_rewards(&request, day(20))
            .await
            .is_ok());

        let request = RewardsRequest {
            start_date: day(4),
            end_date: day(5),
            ..request
        };
        assert!(matches!(
            harness.aggregator.validator_rewards(&request, day(20)).await,
            Err(Error::MissingBalance { slot, .. }) if slot == eod(3)
        ));
    }

    #[tokio::test]
    async fn minipool_shares_skip_the_smoothing_pool() {
        let harness = Harness::new();
        let node = RocketPoolNode {
            address: Address::repeat_byte(0x44),
            fee_distributor: Address::repeat_byte(0x45),
        };
        harness.store.upsert_rocket_pool_node(&node).unwrap();
        harness
            .store
            .upsert_minipool(&Minipool {
                address: Address::repeat_byte(0x46),
                node_address: node.address,
                pubkey: None,
                validator_index: Some(VALIDATOR),
                initial_bond_wei: 16 * WEI_PER_ETH,
                initial_fee: WEI_PER_ETH / 10,
                bond_reductions: vec![],
            })
            .unwrap();

        harness
            .store
            .upsert_block_reward(&BlockRewardRecord {
                fee_recipient: Some(node.address),
                ..proposal(eod(1) - 100, 50)
            })
            .unwrap();
        harness
            .store
            .upsert_block_reward(&BlockRewardRecord {
                mev: Some(true),
                mev_reward_recipient: Some(SMOOTHING_POOL_ADDRESS.parse().unwrap()),
                mev_reward_value_wei: Some(1_000),
                ..proposal(eod(1) - 50, 1)
            })
            .unwrap();
        harness
            .store
            .insert_withdrawals(&[Withdrawal {
                slot: eod(1) + 10,
                validator_index: VALIDATOR,
                address: Address::repeat_byte(0x46),
                amount_gwei: 50_000_000,
            }])
            .unwrap();

        let rewards = harness.rewards().await.unwrap().remove(0);
        assert_eq!(
            rewards.execution_layer_rewards,
            vec![RewardForDate {
                date: day(1),
                amount_wei: 1_050,
            }]
        );

        let rocket_pool = rewards.rocket_pool.unwrap();
        assert_eq!(rocket_pool.node_address, node.address);
        assert_eq!(
            rocket_pool.execution_layer_rewards,
            vec![RewardForDate {
                date: day(1),
                amount_wei: 50,
            }]
        );
        // Half the withdrawal for the bond plus 10% of the other half.
        assert_eq!(
            rocket_pool.withdrawals,
            vec![RewardForDate {
                date: day(2),
                amount_wei: 27_500_000 * WEI_PER_GWEI,
            }]
        );
    }
}
