use super::{finalized_slot, Error};
use crate::metrics;
use crate::store::RewardStore;
use crate::types::{date_for_slot, end_of_day_slot, BalanceSnapshot};
use chain_clients::BeaconClient;
use chrono::NaiveDate;
use log::{debug, info};
use std::sync::Arc;

const MAX_SNAPSHOTS_PER_RUN: usize = 2;

/// Takes validator balance snapshots at slot 0 and at the last slot of every UTC day.
pub struct BalanceIndexer {
    beacon: Arc<dyn BeaconClient>,
    store: Arc<dyn RewardStore>,
    /// Only these validators are snapshotted if set.
    validator_indexes: Option<Vec<u64>>,
}

impl BalanceIndexer {
    pub fn new(
        beacon: Arc<dyn BeaconClient>,
        store: Arc<dyn RewardStore>,
        validator_indexes: Option<Vec<u64>>,
    ) -> Self {
        Self {
            beacon,
            store,
            validator_indexes,
        }
    }

    /// Slot 0 followed by the end-of-day slot of every finalized day, oldest first.
    pub fn snapshot_slots(finalized: u64) -> Vec<u64> {
        let mut slots = vec![0];
        let mut day: Option<NaiveDate> = Some(date_for_slot(0));
        while let Some(date) = day {
            let slot = end_of_day_slot(date);
            if slot > finalized {
                break;
            }
            slots.push(slot);
            day = date.succ_opt();
        }
        slots
    }

    /// Returns the number of snapshots stored.
    pub async fn run(&self) -> Result<usize, Error> {
        let finalized = finalized_slot(self.beacon.as_ref()).await?;
        let stored = self.store.balance_slots()?;
        let pending: Vec<u64> = Self::snapshot_slots(finalized)
            .into_iter()
            .filter(|slot| !stored.contains(slot))
            .take(MAX_SNAPSHOTS_PER_RUN)
            .collect();

        if pending.is_empty() {
            debug!("Balance snapshots are up to date");
            return Ok(0);
        }

        let mut count = 0;
        for slot in pending {
            let balances = self
                .beacon
                .balances_for_slot(slot, self.validator_indexes.as_deref())
                .await?;
            let snapshots: Vec<BalanceSnapshot> = balances
                .into_iter()
                .map(|balance| BalanceSnapshot {
                    slot,
                    validator_index: balance.validator_index,
                    balance_gwei: balance.balance_gwei,
                })
                .collect();
            self.store.insert_balances(&snapshots)?;
            info!(
                "Stored {} balances for slot {} ({})",
                snapshots.len(),
                slot,
                date_for_slot(slot)
            );
            count += snapshots.len();
        }
        metrics::inc_counter_by(&metrics::BALANCES_INDEXED, count as u64);
        Ok(count)
    }
}
