use super::{finalized_slot, Error};
use crate::metrics;
use crate::store::RewardStore;
use chain_clients::BeaconClient;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info};
use std::sync::Arc;

/// The first mainnet slot able to contain withdrawals.
pub const CAPELLA_START_SLOT: u64 = 6_209_536;

const MAX_SLOTS_PER_RUN: u64 = 3_200;
const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Forward fills the `withdrawals` table from the highest stored slot up to the finalized slot.
pub struct WithdrawalsIndexer {
    beacon: Arc<dyn BeaconClient>,
    store: Arc<dyn RewardStore>,
    start_slot: u64,
}

impl WithdrawalsIndexer {
    pub fn new(beacon: Arc<dyn BeaconClient>, store: Arc<dyn RewardStore>) -> Self {
        Self {
            beacon,
            store,
            start_slot: CAPELLA_START_SLOT,
        }
    }

    pub fn with_start_slot(mut self, start_slot: u64) -> Self {
        self.start_slot = start_slot;
        self
    }

    /// Returns the number of withdrawals stored.
    pub async fn run(&self) -> Result<usize, Error> {
        let first_slot = match self.store.highest_withdrawal_slot()? {
            Some(highest) => (highest + 1).max(self.start_slot),
            None => self.start_slot,
        };
        let finalized = finalized_slot(self.beacon.as_ref()).await?;
        if first_slot > finalized {
            debug!("Withdrawals are up to date with finalized slot {}", finalized);
            return Ok(0);
        }
        let last_slot = finalized.min(first_slot + MAX_SLOTS_PER_RUN - 1);

        // Slots are stored in order so that the highest stored slot is a valid resume point.
        let per_slot: Vec<_> = stream::iter(first_slot..=last_slot)
            .map(|slot| self.beacon.withdrawals_for_slot(slot))
            .buffered(MAX_CONCURRENT_REQUESTS)
            .try_collect()
            .await?;

        let mut count = 0;
        for withdrawals in per_slot.into_iter().filter(|w| !w.is_empty()) {
            self.store.insert_withdrawals(&withdrawals)?;
            count += withdrawals.len();
        }
        metrics::inc_counter_by(&metrics::WITHDRAWALS_INDEXED, count as u64);

        info!(
            "Indexed {} withdrawals for slots {}..={}",
            count, first_slot, last_slot
        );
        Ok(count)
    }
}
