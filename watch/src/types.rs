use chain_clients::{Address, Wei, MAINNET_GENESIS_TIME, SECONDS_PER_SLOT};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The classification of one slot, as persisted in the `block_rewards` table.
///
/// A missed slot has every optional field set to `None` and `processed_ok == true`. A slot whose
/// classification failed keeps the proposer fields so it can be attributed to a validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRewardRecord {
    pub slot: u64,
    pub block_number: Option<u64>,
    pub proposer_index: Option<u64>,
    pub fee_recipient: Option<Address>,
    #[serde(with = "option_wei")]
    pub priority_fees_wei: Option<Wei>,
    pub block_extra_data: Option<Vec<u8>>,
    pub mev: Option<bool>,
    pub mev_reward_recipient: Option<Address>,
    #[serde(with = "option_wei")]
    pub mev_reward_value_wei: Option<Wei>,
    pub processed_ok: bool,
}

impl BlockRewardRecord {
    pub fn missed(slot: u64) -> Self {
        Self {
            slot,
            block_number: None,
            proposer_index: None,
            fee_recipient: None,
            priority_fees_wei: None,
            block_extra_data: None,
            mev: None,
            mev_reward_recipient: None,
            mev_reward_value_wei: None,
            processed_ok: true,
        }
    }

    /// The execution-layer income of the proposer: the MEV payment if there was one, the priority
    /// fees otherwise.
    pub fn execution_reward(&self) -> Wei {
        if self.mev == Some(true) {
            self.mev_reward_value_wei.unwrap_or_default()
        } else {
            self.priority_fees_wei.unwrap_or_default()
        }
    }

    /// The address which received `execution_reward`.
    pub fn reward_recipient(&self) -> Option<Address> {
        if self.mev == Some(true) {
            self.mev_reward_recipient
        } else {
            self.fee_recipient
        }
    }
}

/// A validator's balance at the end of a day (or at its activation slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub slot: u64,
    pub validator_index: u64,
    pub balance_gwei: u64,
}

/// An amount credited to a validator on a given UTC day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardForDate {
    pub date: NaiveDate,
    #[serde(with = "wei")]
    pub amount_wei: Wei,
}

pub fn datetime_for_slot(slot: u64) -> DateTime<Utc> {
    let timestamp = MAINNET_GENESIS_TIME + slot * SECONDS_PER_SLOT;
    Utc.timestamp_opt(timestamp as i64, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn date_for_slot(slot: u64) -> NaiveDate {
    datetime_for_slot(slot).date_naive()
}

/// The slot in progress at `datetime`. Datetimes before genesis map to slot 0.
pub fn slot_for_datetime(datetime: DateTime<Utc>) -> u64 {
    let timestamp = datetime.timestamp();
    if timestamp < MAINNET_GENESIS_TIME as i64 {
        return 0;
    }
    (timestamp as u64 - MAINNET_GENESIS_TIME) / SECONDS_PER_SLOT
}

/// The last slot which starts on `date` (UTC).
pub fn end_of_day_slot(date: NaiveDate) -> u64 {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    slot_for_datetime(date.and_time(end_of_day).and_utc())
}

/// Wei amounts are serialized as decimal strings since they exceed the range of JSON numbers.
pub mod wei {
    use chain_clients::Wei;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Wei, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Wei, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

pub mod option_wei {
    use chain_clients::Wei;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Wei>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Wei>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(de::Error::custom))
            .transpose()
    }
}
