use crate::database::Error;
use crate::store::RewardStore;
use std::collections::HashSet;

/// Decides, at the start of a run, which slots of a range need no further work.
pub trait SlotCursor: Send + Sync {
    fn processed_slots(
        &self,
        store: &dyn RewardStore,
        min_slot: u64,
        max_slot: u64,
    ) -> Result<HashSet<u64>, Error>;
}

/// Treats every slot with a stored record as processed.
///
/// With `retry_failed`, records which were not processed ok are attempted again.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCursor {
    pub retry_failed: bool,
}

impl SlotCursor for StoreCursor {
    fn processed_slots(
        &self,
        store: &dyn RewardStore,
        min_slot: u64,
        max_slot: u64,
    ) -> Result<HashSet<u64>, Error> {
        let mut slots = store.block_reward_slots(min_slot, max_slot)?;
        if self.retry_failed {
            for record in store.failed_block_rewards()? {
                slots.remove(&record.slot);
            }
        }
        Ok(slots)
    }
}

/// Processes every slot again, overwriting stored records.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullReindex;

impl SlotCursor for FullReindex {
    fn processed_slots(
        &self,
        _store: &dyn RewardStore,
        _min_slot: u64,
        _max_slot: u64,
    ) -> Result<HashSet<u64>, Error> {
        Ok(HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::BlockRewardRecord;

    #[test]
    fn failed_slots_are_retried_on_request() {
        let store = MemoryStore::new();
        store.upsert_block_reward(&BlockRewardRecord::missed(1)).unwrap();
        let mut failed = BlockRewardRecord::missed(2);
        failed.processed_ok = false;
        store.upsert_block_reward(&failed).unwrap();

        let all = StoreCursor::default()
            .processed_slots(&store, 0, 10)
            .unwrap();
        assert_eq!(all, HashSet::from([1, 2]));

        let retry = StoreCursor { retry_failed: true }
            .processed_slots(&store, 0, 10)
            .unwrap();
        assert_eq!(retry, HashSet::from([1]));

        assert!(FullReindex.processed_slots(&store, 0, 10).unwrap().is_empty());
    }
}
