use chain_clients::test_utils::{
    MockBeaconClient, MockExecutionClient, MockRelayClient, MockRelayResponse, MockTransaction,
};
use chain_clients::{
    Address, BeaconClient, RelayClient, RelayPayload, SlotProposerData, Wei, B256, U256, WEI_PER_GWEI,
};
use chrono::NaiveDate;
use reqwest::StatusCode;
use rewards_watch::{
    aggregation::{RewardAggregator, RewardsRequest},
    builders::BuilderRegistry,
    classifier::{self, BlockRewardClassifier, Strategy},
    client::{Error as ClientError, WatchHttpClient},
    indexer::BlockRewardsIndexer,
    reconcile::Distributors,
    server::{start_server, Context, MissingData},
    store::{MemoryStore, RewardStore},
    types::{end_of_day_slot, BalanceSnapshot, RewardForDate},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

const FLASHBOTS_SLOT: u64 = 5_000_000;
const FLASHBOTS_BLOCK: u64 = 15_838_000;
const FLASHBOTS_PROPOSER: u64 = 123;
const FLASHBOTS_FEE_RECIPIENT: &str = "0xdafea492d9c6733ae3d56b7ed1adb60692c98bc5";
const MEV_RECIPIENT: &str = "0xe688b84b23f322a994a53dbf8e15fa82cdb71127";
const MEV_VALUE: Wei = 28_854_222_256_963_892;
const FLASHBOTS_EXTRA_DATA: &[u8] = b"Illuminate Dmocratize Dstribute";

const FAILING_PROPOSER: u64 = 222;

fn address(s: &str) -> Address {
    s.parse().unwrap()
}

fn block_hash(block_number: u64) -> B256 {
    B256::from(U256::from(block_number))
}

/// Slot 5000000 is on 2022-10-26 UTC.
fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 10, d).unwrap()
}

struct Tester {
    pub beacon: Arc<MockBeaconClient>,
    pub execution: Arc<MockExecutionClient>,
    pub store: Arc<MemoryStore>,
    pub classifier: Arc<BlockRewardClassifier>,
    pub indexer: BlockRewardsIndexer,
    pub client: WatchHttpClient,
    _watch_shutdown_tx: oneshot::Sender<()>,
}

impl Tester {
    pub async fn new() -> Self {
        Self::with_relays(vec![]).await
    }

    pub async fn with_relays(relays: Vec<Arc<dyn RelayClient>>) -> Self {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        let store = Arc::new(MemoryStore::new());
        beacon.set_head(FLASHBOTS_SLOT + 100, (FLASHBOTS_SLOT + 64) / 32);

        let classifier = Arc::new(BlockRewardClassifier::new(
            beacon.clone(),
            execution.clone(),
            relays,
            Arc::new(BuilderRegistry::mainnet().unwrap()),
            Distributors::mainnet().unwrap(),
        ));
        let indexer = BlockRewardsIndexer::new(beacon.clone(), classifier.clone(), store.clone())
            .with_start_slot(FLASHBOTS_SLOT - 10);

        /*
         * Spawn a Watch HTTP API.
         */

        let ctx = Context {
            store: store.clone(),
            aggregator: RewardAggregator::new(store.clone(), beacon.clone(), execution.clone()),
        };
        let (_watch_shutdown_tx, watch_shutdown_rx) = oneshot::channel();
        let (watch_listening_socket, watch_server) = start_server(
            Arc::new(ctx),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            async {
                let _ = watch_shutdown_rx.await;
            },
        )
        .await
        .unwrap();
        tokio::spawn(watch_server);

        /*
         * Create a HTTP client to talk to the watch HTTP API.
         */

        let client = WatchHttpClient {
            client: reqwest::Client::new(),
            server: Url::parse(&format!(
                "http://{}:{}",
                watch_listening_socket.ip(),
                watch_listening_socket.port()
            ))
            .unwrap(),
        };

        Self {
            beacon,
            execution,
            store,
            classifier,
            indexer,
            client,
            _watch_shutdown_tx,
        }
    }

    fn add_slot(&self, slot: u64, proposer_index: u64, fee_recipient: Address, block: u64) {
        self.beacon.add_slot(SlotProposerData {
            slot,
            proposer_index: Some(proposer_index),
            fee_recipient: Some(fee_recipient),
            block_number: Some(block),
            block_hash: Some(block_hash(block)),
        });
    }

    /// The Flashbots builder pays the proposer's fee recipient in the block's last transaction.
    pub fn with_flashbots_block(self) -> Self {
        let builder = address(FLASHBOTS_FEE_RECIPIENT);
        let recipient = address(MEV_RECIPIENT);
        let searcher = Address::repeat_byte(0x5e);
        self.add_slot(FLASHBOTS_SLOT, FLASHBOTS_PROPOSER, builder, FLASHBOTS_BLOCK);
        self.execution.add_block(
            FLASHBOTS_BLOCK,
            builder,
            FLASHBOTS_EXTRA_DATA,
            0,
            vec![
                MockTransaction::new(searcher, Some(searcher), 0, 900),
                MockTransaction::new(builder, Some(recipient), MEV_VALUE, 21_000),
            ],
        );
        self.execution
            .set_balance(recipient, FLASHBOTS_BLOCK, MEV_VALUE);
        self
    }

    /// A block whose fee recipient received exactly the priority fees.
    pub fn with_plain_block(self, slot: u64, proposer_index: u64, fees: Wei) -> Self {
        let block = FLASHBOTS_BLOCK + (slot - FLASHBOTS_SLOT);
        let fee_recipient = Address::repeat_byte(0x55);
        let sender = Address::repeat_byte(0x56);
        self.add_slot(slot, proposer_index, fee_recipient, block);
        self.execution.add_block(
            block,
            fee_recipient,
            b"geth go1.19",
            0,
            vec![MockTransaction::new(sender, Some(sender), 0, fees)],
        );
        self.execution.set_balance(fee_recipient, block - 1, 1_000);
        self.execution
            .set_balance(fee_recipient, block, 1_000 + fees);
        self
    }

    /// A block whose fee recipient balance changed for no known reason.
    pub fn with_unexplained_block(self, slot: u64) -> Self {
        let block = FLASHBOTS_BLOCK + (slot - FLASHBOTS_SLOT);
        let fee_recipient = Address::repeat_byte(0x77);
        self.add_slot(slot, FAILING_PROPOSER, fee_recipient, block);
        self.execution
            .add_block(block, fee_recipient, b"", 0, vec![]);
        self.execution.set_balance(fee_recipient, block, 77);
        self
    }

    /// End-of-day balances of `validator_index` for the 25th and 26th.
    pub fn with_balances(self, validator_index: u64, gwei: [u64; 2]) -> Self {
        self.beacon.set_activation_slot(validator_index, Some(0));
        let snapshots: Vec<BalanceSnapshot> = [day(25), day(26)]
            .into_iter()
            .zip(gwei)
            .map(|(date, balance_gwei)| BalanceSnapshot {
                slot: end_of_day_slot(date),
                validator_index,
                balance_gwei,
            })
            .collect();
        self.store.insert_balances(&snapshots).unwrap();
        self
    }

    pub async fn index(self) -> Self {
        self.indexer
            .index_block_rewards(FLASHBOTS_SLOT - 5..=FLASHBOTS_SLOT + 5)
            .await
            .unwrap();
        self
    }

    pub async fn assert_mev(self, slot: u64, recipient: Address, value: Wei) -> Self {
        let record = self.client.get_block_reward(slot).await.unwrap().unwrap();
        assert!(record.processed_ok);
        assert_eq!(record.mev, Some(true));
        assert_eq!(record.mev_reward_recipient, Some(recipient));
        assert_eq!(record.mev_reward_value_wei, Some(value));
        self
    }

    pub async fn assert_no_mev(self, slot: u64, fees: Wei) -> Self {
        let record = self.client.get_block_reward(slot).await.unwrap().unwrap();
        assert!(record.processed_ok);
        assert_eq!(record.mev, Some(false));
        assert_eq!(record.priority_fees_wei, Some(fees));

        // The fee recipient's adjusted delta is exactly the priority fees.
        let delta = self
            .classifier
            .reconciler()
            .adjusted_balance_delta(
                record.fee_recipient.unwrap(),
                record.block_number.unwrap(),
                slot,
                fees,
            )
            .await
            .unwrap();
        assert_eq!(delta, fees);
        self
    }

    pub async fn assert_missed(self, slot: u64) -> Self {
        let record = self.client.get_block_reward(slot).await.unwrap().unwrap();
        assert!(record.processed_ok);
        assert_eq!(record.proposer_index, None);
        self
    }

    pub async fn assert_not_indexed(self, slot: u64) -> Self {
        assert_eq!(self.client.get_block_reward(slot).await.unwrap(), None);
        self
    }

    pub async fn assert_missing_data(self, expected: Vec<MissingData>) -> Self {
        assert_eq!(self.client.get_missing_data().await.unwrap(), expected);
        self
    }

    /// Re-indexing the same range changes nothing.
    pub async fn assert_idempotent(self) -> Self {
        let count = self.store.block_reward_count();
        let before = self
            .store
            .block_rewards_in_range(0, u64::MAX, &[FLASHBOTS_PROPOSER, FAILING_PROPOSER])
            .unwrap();

        let summary = self
            .indexer
            .index_block_rewards(FLASHBOTS_SLOT - 5..=FLASHBOTS_SLOT + 5)
            .await
            .unwrap();
        assert_eq!(summary.attempted(), 0);
        assert_eq!(self.store.block_reward_count(), count);
        assert_eq!(
            self.store
                .block_rewards_in_range(0, u64::MAX, &[FLASHBOTS_PROPOSER, FAILING_PROPOSER])
                .unwrap(),
            before
        );
        self
    }

    pub async fn assert_rewards(
        self,
        validator_index: u64,
        consensus_layer_wei: Wei,
        execution_layer_wei: Wei,
    ) -> Self {
        let rewards = self
            .client
            .post_rewards(&RewardsRequest {
                validator_indexes: vec![validator_index],
                start_date: day(26),
                end_date: day(27),
            })
            .await
            .unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(
            rewards[0].consensus_layer_rewards,
            vec![RewardForDate {
                date: day(26),
                amount_wei: consensus_layer_wei,
            }]
        );
        assert_eq!(
            rewards[0].execution_layer_rewards,
            vec![RewardForDate {
                date: day(26),
                amount_wei: execution_layer_wei,
            }]
        );
        self
    }

    pub async fn assert_rewards_refused(self, validator_index: u64) -> Self {
        let err = self
            .client
            .post_rewards(&RewardsRequest {
                validator_indexes: vec![validator_index],
                start_date: day(26),
                end_date: day(27),
            })
            .await
            .unwrap_err();
        match err {
            ClientError::Server { status, .. } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("unexpected error {:?}", other),
        }
        self
    }
}

#[tokio::test]
async fn flashbots_last_tx_payment() {
    Tester::new()
        .await
        .with_flashbots_block()
        .assert_not_indexed(FLASHBOTS_SLOT)
        .await
        .index()
        .await
        .assert_mev(FLASHBOTS_SLOT, address(MEV_RECIPIENT), MEV_VALUE)
        .await
        .assert_missed(FLASHBOTS_SLOT + 1)
        .await
        .assert_idempotent()
        .await;
}

#[tokio::test]
async fn plain_blocks_reconcile_with_priority_fees() {
    Tester::new()
        .await
        .with_plain_block(FLASHBOTS_SLOT + 2, 7, 4_321)
        .index()
        .await
        .assert_no_mev(FLASHBOTS_SLOT + 2, 4_321)
        .await;
}

#[tokio::test]
async fn failures_are_isolated_and_refuse_rewards() {
    Tester::new()
        .await
        .with_flashbots_block()
        .with_unexplained_block(FLASHBOTS_SLOT + 3)
        .with_balances(FLASHBOTS_PROPOSER, [32_000_000_000, 32_002_000_000])
        .with_balances(FAILING_PROPOSER, [32_000_000_000, 32_001_000_000])
        .index()
        .await
        .assert_mev(FLASHBOTS_SLOT, address(MEV_RECIPIENT), MEV_VALUE)
        .await
        .assert_missing_data(vec![MissingData {
            validator_index: Some(FAILING_PROPOSER),
            slots: vec![FLASHBOTS_SLOT + 3],
        }])
        .await
        .assert_rewards(FLASHBOTS_PROPOSER, 2_000_000 * WEI_PER_GWEI, MEV_VALUE)
        .await
        .assert_rewards_refused(FAILING_PROPOSER)
        .await
        .assert_idempotent()
        .await;
}

#[tokio::test]
async fn relay_attestation_takes_precedence() {
    let payload = RelayPayload {
        slot: FLASHBOTS_SLOT,
        block_hash: block_hash(FLASHBOTS_BLOCK),
        builder_pubkey: "0xaa".to_string(),
        proposer_fee_recipient: address(MEV_RECIPIENT),
        value: U256::from(MEV_VALUE as u128),
        block_number: FLASHBOTS_BLOCK,
    };
    let relays: Vec<Arc<dyn RelayClient>> = vec![
        Arc::new(MockRelayClient::new(
            "down",
            MockRelayResponse::ServerError,
            Duration::ZERO,
        )),
        Arc::new(MockRelayClient::new(
            "flashbots",
            MockRelayResponse::Delivered(payload),
            Duration::from_millis(10),
        )),
    ];
    let tester = Tester::with_relays(relays).await.with_flashbots_block();

    let data = tester
        .beacon
        .get_slot_proposer_data(FLASHBOTS_SLOT)
        .await
        .unwrap();
    let classification = tester.classifier.classify(&data).await.unwrap();
    assert_eq!(classification.strategy, Strategy::RelayAttestation);
    assert_eq!(classification.value.mev_value, Some(MEV_VALUE));

    tester
        .index()
        .await
        .assert_mev(FLASHBOTS_SLOT, address(MEV_RECIPIENT), MEV_VALUE)
        .await;
}

#[tokio::test]
async fn negative_mev_is_a_hard_failure() {
    let tester = Tester::new().await.with_flashbots_block();
    // The recipient's balance dropped across the block.
    tester
        .execution
        .set_balance(address(MEV_RECIPIENT), FLASHBOTS_BLOCK - 1, MEV_VALUE * 2);

    let data = tester
        .beacon
        .get_slot_proposer_data(FLASHBOTS_SLOT)
        .await
        .unwrap();
    let err = tester.classifier.classify(&data).await.unwrap_err();
    assert!(
        matches!(err, classifier::Error::InvariantViolation(_)),
        "{:?}",
        err
    );

    tester
        .index()
        .await
        .assert_missing_data(vec![MissingData {
            validator_index: Some(FLASHBOTS_PROPOSER),
            slots: vec![FLASHBOTS_SLOT],
        }])
        .await;
}
