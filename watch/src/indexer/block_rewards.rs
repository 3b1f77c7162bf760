use super::{finalized_slot, Error, SlotCursor, StoreCursor};
use crate::classifier::{BlockRewardClassifier, Classification};
use crate::metrics;
use crate::store::RewardStore;
use crate::types::BlockRewardRecord;
use chain_clients::{BeaconClient, SlotProposerData};
use log::{debug, error, info, warn};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// The first mainnet slot with an execution payload.
pub const START_SLOT: u64 = 4_700_013;
pub const DEFAULT_MAX_CONCURRENT_SLOTS: usize = 10;

/// `run` works through the chain in windows of this many slots, newest first.
const SLOTS_PER_WINDOW: u64 = 10_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexingSummary {
    pub classified: usize,
    pub missed: usize,
    pub failed: usize,
    pub already_processed: usize,
    pub not_finalized: usize,
}

impl IndexingSummary {
    pub fn attempted(&self) -> usize {
        self.classified + self.missed + self.failed
    }

    fn add(&mut self, other: IndexingSummary) {
        self.classified += other.classified;
        self.missed += other.missed;
        self.failed += other.failed;
        self.already_processed += other.already_processed;
        self.not_finalized += other.not_finalized;
    }
}

enum SlotOutcome {
    Classified,
    Missed,
    Failed,
}

pub fn record_for_classification(
    data: &SlotProposerData,
    classification: &Classification,
) -> BlockRewardRecord {
    let value = &classification.value;
    BlockRewardRecord {
        slot: data.slot,
        block_number: data.block_number,
        proposer_index: data.proposer_index,
        fee_recipient: data.fee_recipient,
        priority_fees_wei: Some(value.priority_fees),
        block_extra_data: Some(classification.extra_data.to_vec()),
        mev: Some(value.contains_mev),
        mev_reward_recipient: value.mev_recipient,
        mev_reward_value_wei: value.mev_value,
        processed_ok: true,
    }
}

/// Keeps what the beacon node told us about the slot so the failure can be attributed to its
/// proposer.
pub fn failed_record(data: &SlotProposerData) -> BlockRewardRecord {
    BlockRewardRecord {
        block_number: data.block_number,
        proposer_index: data.proposer_index,
        fee_recipient: data.fee_recipient,
        processed_ok: false,
        ..BlockRewardRecord::missed(data.slot)
    }
}

#[derive(Clone)]
struct SlotWorker {
    beacon: Arc<dyn BeaconClient>,
    classifier: Arc<BlockRewardClassifier>,
    store: Arc<dyn RewardStore>,
}

impl SlotWorker {
    async fn index_slot(&self, slot: u64) -> Result<SlotOutcome, Error> {
        metrics::set_gauge(&metrics::SLOT_BEING_INDEXED, slot as i64);

        let data = match self.beacon.get_slot_proposer_data(slot).await {
            Ok(data) => data,
            Err(e) => {
                error!("Unable to get proposer data for slot {}: {}", slot, e);
                metrics::inc_counter(&metrics::SLOTS_INDEXING_FAILURES);
                self.store
                    .upsert_block_reward(&failed_record(&SlotProposerData::missed(slot)))?;
                return Ok(SlotOutcome::Failed);
            }
        };

        if data.block_number.is_none() {
            debug!("Slot {} was missed", slot);
            self.store
                .upsert_block_reward(&BlockRewardRecord::missed(slot))?;
            return Ok(SlotOutcome::Missed);
        }

        match self.classifier.classify(&data).await {
            Ok(classification) => {
                self.store
                    .upsert_block_reward(&record_for_classification(&data, &classification))?;
                Ok(SlotOutcome::Classified)
            }
            Err(e) => {
                error!(
                    "Block reward of slot {} needs manual inspection, proposer: {:?}, fee recipient: {:?}, error: {}",
                    slot, data.proposer_index, data.fee_recipient, e
                );
                metrics::inc_counter(&metrics::SLOTS_INDEXING_FAILURES);
                self.store.upsert_block_reward(&failed_record(&data))?;
                Ok(SlotOutcome::Failed)
            }
        }
    }
}

/// Classifies and stores the block reward of every finalized slot.
///
/// Slots are processed newest first with at most `max_concurrent_slots` in flight. A slot which
/// cannot be classified is stored with `processed_ok == false` and never stops the other slots.
pub struct BlockRewardsIndexer {
    worker: SlotWorker,
    cursor: Box<dyn SlotCursor>,
    max_concurrent_slots: usize,
    start_slot: u64,
    /// Only ever increases, even if a beacon node behind a load balancer lags behind.
    finalized_slot: AtomicU64,
}

impl BlockRewardsIndexer {
    pub fn new(
        beacon: Arc<dyn BeaconClient>,
        classifier: Arc<BlockRewardClassifier>,
        store: Arc<dyn RewardStore>,
    ) -> Self {
        Self {
            worker: SlotWorker {
                beacon,
                classifier,
                store,
            },
            cursor: Box::new(StoreCursor::default()),
            max_concurrent_slots: DEFAULT_MAX_CONCURRENT_SLOTS,
            start_slot: START_SLOT,
            finalized_slot: AtomicU64::new(0),
        }
    }

    pub fn with_cursor(mut self, cursor: Box<dyn SlotCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_max_concurrent_slots(mut self, max_concurrent_slots: usize) -> Self {
        self.max_concurrent_slots = max_concurrent_slots.max(1);
        self
    }

    pub fn with_start_slot(mut self, start_slot: u64) -> Self {
        self.start_slot = start_slot;
        self
    }

    async fn refresh_finalized_slot(&self) -> Result<u64, Error> {
        let latest = finalized_slot(self.worker.beacon.as_ref()).await?;
        let previous = self.finalized_slot.fetch_max(latest, Ordering::SeqCst);
        if latest < previous {
            warn!(
                "Beacon node reports finalized slot {} behind previously seen {}",
                latest, previous
            );
        }
        Ok(latest.max(previous))
    }

    /// Indexes every slot of `slots` which is finalized and not yet processed according to the
    /// cursor. Re-running over an indexed range does nothing.
    pub async fn index_block_rewards(
        &self,
        slots: RangeInclusive<u64>,
    ) -> Result<IndexingSummary, Error> {
        let finalized = self.refresh_finalized_slot().await?;
        let summary = self.index_window(slots, finalized).await?;
        self.update_failure_gauge()?;
        Ok(summary)
    }

    /// Indexes every finalized slot from the start slot onwards.
    pub async fn run(&self) -> Result<IndexingSummary, Error> {
        let finalized = self.refresh_finalized_slot().await?;
        let mut summary = IndexingSummary::default();
        if finalized < self.start_slot {
            debug!("No finalized slots to index yet");
            return Ok(summary);
        }

        let mut missing = 0;
        let mut window_end = finalized;
        loop {
            let window_start = window_end
                .saturating_sub(SLOTS_PER_WINDOW - 1)
                .max(self.start_slot);
            let processed =
                self.cursor
                    .processed_slots(self.worker.store.as_ref(), window_start, window_end)?;
            missing += (window_end - window_start + 1) as usize - processed.len();

            summary.add(self.index_window(window_start..=window_end, finalized).await?);

            if window_start == self.start_slot {
                break;
            }
            window_end = window_start - 1;
        }
        metrics::set_gauge(
            &metrics::SLOTS_WITH_MISSING_BLOCK_REWARDS,
            (missing.saturating_sub(summary.attempted()) + summary.failed) as i64,
        );
        self.update_failure_gauge()?;

        info!(
            "Block rewards indexed up to finalized slot {}: {:?}",
            finalized, summary
        );
        Ok(summary)
    }

    async fn index_window(
        &self,
        slots: RangeInclusive<u64>,
        finalized: u64,
    ) -> Result<IndexingSummary, Error> {
        let mut summary = IndexingSummary::default();
        let (min_slot, max_slot) = (*slots.start(), *slots.end());
        if min_slot > max_slot {
            return Ok(summary);
        }

        let processed =
            self.cursor
                .processed_slots(self.worker.store.as_ref(), min_slot, max_slot)?;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_slots));
        let mut tasks = JoinSet::new();

        for slot in slots.rev() {
            if processed.contains(&slot) {
                summary.already_processed += 1;
                continue;
            }
            if slot > finalized {
                summary.not_finalized += 1;
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            let worker = self.worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (slot, worker.index_slot(slot).await)
            });

            while let Some(joined) = tasks.try_join_next() {
                record_outcome(joined, &mut summary);
            }
        }
        while let Some(joined) = tasks.join_next().await {
            record_outcome(joined, &mut summary);
        }

        debug!(
            "Indexed block rewards for slots {}..={}: {:?}",
            min_slot, max_slot, summary
        );
        Ok(summary)
    }

    fn update_failure_gauge(&self) -> Result<(), Error> {
        let failed = self.worker.store.failed_block_rewards()?.len();
        metrics::set_gauge(&metrics::BLOCK_REWARDS_NOT_PROCESSED_OK, failed as i64);
        Ok(())
    }
}

fn record_outcome(
    joined: Result<(u64, Result<SlotOutcome, Error>), JoinError>,
    summary: &mut IndexingSummary,
) {
    match joined {
        Ok((_, Ok(SlotOutcome::Classified))) => summary.classified += 1,
        Ok((_, Ok(SlotOutcome::Missed))) => summary.missed += 1,
        Ok((_, Ok(SlotOutcome::Failed))) => summary.failed += 1,
        Ok((slot, Err(e))) => {
            error!("Unable to store block reward of slot {}: {}", slot, e);
            metrics::inc_counter(&metrics::SLOTS_INDEXING_FAILURES);
            summary.failed += 1;
        }
        Err(e) => {
            error!("Block reward task failed: {}", e);
            metrics::inc_counter(&metrics::SLOTS_INDEXING_FAILURES);
            summary.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::BuilderRegistry;
    use crate::reconcile::Distributors;
    use crate::store::MemoryStore;
    use chain_clients::test_utils::{MockBeaconClient, MockExecutionClient, MockTransaction};
    use chain_clients::Address;

    struct Harness {
        beacon: Arc<MockBeaconClient>,
        execution: Arc<MockExecutionClient>,
        store: Arc<MemoryStore>,
        indexer: BlockRewardsIndexer,
    }

    impl Harness {
        fn new() -> Self {
            let beacon = Arc::new(MockBeaconClient::new());
            let execution = Arc::new(MockExecutionClient::new());
            let store = Arc::new(MemoryStore::new());
            let classifier = Arc::new(BlockRewardClassifier::new(
                beacon.clone(),
                execution.clone(),
                vec![],
                Arc::new(BuilderRegistry::mainnet().unwrap()),
                Distributors::default(),
            ));
            let indexer = BlockRewardsIndexer::new(beacon.clone(), classifier, store.clone())
                .with_start_slot(64);
            Self {
                beacon,
                execution,
                store,
                indexer,
            }
        }

        /// A block at `slot` paying `fees` in priority fees to its fee recipient.
        fn add_plain_block(&self, slot: u64, block_number: u64, fees: i128) {
            let fee_recipient = Address::repeat_byte(slot as u8);
            let sender = Address::repeat_byte(0x11);
            self.beacon.add_slot(SlotProposerData {
                slot,
                proposer_index: Some(slot * 10),
                fee_recipient: Some(fee_recipient),
                block_number: Some(block_number),
                block_hash: None,
            });
            self.execution.add_block(
                block_number,
                fee_recipient,
                b"geth",
                0,
                vec![MockTransaction::new(sender, Some(sender), 0, fees)],
            );
            self.execution.set_balance(fee_recipient, block_number, fees);
        }
    }

    #[tokio::test]
    async fn unfinalized_slots_are_left_for_later() {
        let harness = Harness::new();
        harness.beacon.set_head(100, 2);
        harness.add_plain_block(64, 1, 10);
        harness.add_plain_block(70, 2, 20);

        let summary = harness.indexer.index_block_rewards(60..=70).await.unwrap();
        assert_eq!(summary.not_finalized, 6);
        assert_eq!(summary.classified, 1);
        assert_eq!(summary.missed, 4);
        assert!(harness.store.block_reward(70).unwrap().is_none());

        harness.beacon.set_head(100, 3);
        let summary = harness.indexer.index_block_rewards(60..=70).await.unwrap();
        assert_eq!(summary.already_processed, 5);
        assert_eq!(summary.classified, 1);
        assert_eq!(
            harness.store.block_reward(70).unwrap().unwrap().priority_fees_wei,
            Some(20)
        );
    }

    #[tokio::test]
    async fn failures_are_recorded_without_stopping_other_slots() {
        let harness = Harness::new();
        harness.beacon.set_head(200, 5);
        harness.add_plain_block(65, 1, 10);
        harness.add_plain_block(66, 2, 10);
        // Unexplained balance change.
        harness
            .execution
            .set_balance(Address::repeat_byte(66), 2, 999);
        harness.beacon.fail_slot(67);

        let summary = harness.indexer.index_block_rewards(65..=67).await.unwrap();
        assert_eq!(summary.classified, 1);
        assert_eq!(summary.failed, 2);

        let failed = harness.store.block_reward(66).unwrap().unwrap();
        assert!(!failed.processed_ok);
        assert_eq!(failed.proposer_index, Some(660));
        assert_eq!(failed.fee_recipient, Some(Address::repeat_byte(66)));
        assert_eq!(failed.mev, None);
        assert!(!harness.store.block_reward(67).unwrap().unwrap().processed_ok);
        assert!(harness.store.block_reward(65).unwrap().unwrap().processed_ok);
    }

    #[tokio::test]
    async fn finalized_slot_never_moves_backwards() {
        let harness = Harness::new();
        harness.beacon.set_head(200, 3);
        harness.indexer.index_block_rewards(64..=64).await.unwrap();
        harness.beacon.set_head(200, 2);

        let summary = harness.indexer.index_block_rewards(90..=96).await.unwrap();
        assert_eq!(summary.not_finalized, 0);
        assert_eq!(summary.missed, 7);
    }

    #[tokio::test]
    async fn run_covers_every_finalized_slot_once() {
        let harness = Harness::new();
        harness.beacon.set_head(200, 3);
        harness.add_plain_block(80, 1, 5);

        let summary = harness.indexer.run().await.unwrap();
        assert_eq!(summary.attempted(), 33);
        assert_eq!(summary.classified, 1);
        assert_eq!(harness.store.block_reward_count(), 33);

        let summary = harness.indexer.run().await.unwrap();
        assert_eq!(summary.attempted(), 0);
        assert_eq!(summary.already_processed, 33);
    }
}
