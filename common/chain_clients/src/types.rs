use crate::Error;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Deserializer, Serialize};

/// An amount of wei. Signed so balance deltas can be represented without a separate type.
///
/// The total ETH supply is around 2^87 wei, far below `i128::MAX`.
pub type Wei = i128;

pub const WEI_PER_GWEI: Wei = 1_000_000_000;
pub const WEI_PER_ETH: Wei = 1_000_000_000_000_000_000;

pub const SLOTS_PER_EPOCH: u64 = 32;
pub const SECONDS_PER_SLOT: u64 = 12;
pub const MAINNET_GENESIS_TIME: u64 = 1_606_824_023;

/// `activation_epoch` of a validator which has not been activated yet.
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

pub fn gwei_to_wei(gwei: u64) -> Wei {
    Wei::from(gwei) * WEI_PER_GWEI
}

pub fn u256_to_wei(value: U256) -> Result<Wei, Error> {
    u128::try_from(value)
        .ok()
        .and_then(|v| Wei::try_from(v).ok())
        .ok_or_else(|| Error::Overflow(format!("{} does not fit into a wei amount", value)))
}

/// Lower-case `0x`-prefixed representation used for storage and comparisons.
pub fn address_to_string(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Decodes block extra data the way block explorers display it: invalid UTF-8 sequences are
/// dropped and an empty field has no value at all.
pub fn decode_extra_data(extra_data: &[u8]) -> Option<String> {
    if extra_data.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(extra_data).replace(char::REPLACEMENT_CHARACTER, ""))
}

pub mod quoted_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QuotedOrNumber {
        Quoted(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match QuotedOrNumber::deserialize(deserializer)? {
            QuotedOrNumber::Quoted(s) => s.parse().map_err(de::Error::custom),
            QuotedOrNumber::Number(n) => Ok(n),
        }
    }
}

pub mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| de::Error::custom(format!("missing 0x prefix: {}", s)))?;
        u64::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/*
 * Consensus layer
 */

/// The execution-layer facts of one slot, as seen by the beacon chain.
///
/// All optional fields are `None` for a missed slot. `fee_recipient` and `block_number` are also
/// `None` for pre-merge blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotProposerData {
    pub slot: u64,
    pub proposer_index: Option<u64>,
    pub fee_recipient: Option<Address>,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
}

impl SlotProposerData {
    pub fn missed(slot: u64) -> Self {
        Self {
            slot,
            proposer_index: None,
            fee_recipient: None,
            block_number: None,
            block_hash: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    #[serde(default)]
    pub slot: u64,
    #[serde(with = "quoted_u64")]
    pub validator_index: u64,
    pub address: Address,
    #[serde(rename = "amount", with = "quoted_u64")]
    pub amount_gwei: u64,
}

impl Withdrawal {
    pub fn amount_wei(&self) -> Wei {
        gwei_to_wei(self.amount_gwei)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBalance {
    #[serde(rename = "index", with = "quoted_u64")]
    pub validator_index: u64,
    #[serde(rename = "balance", with = "quoted_u64")]
    pub balance_gwei: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ValidatorSummary {
    #[serde(with = "quoted_u64")]
    pub index: u64,
    pub validator: ValidatorRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ValidatorRecord {
    pub pubkey: String,
    #[serde(with = "quoted_u64")]
    pub activation_epoch: u64,
}

#[derive(Debug, Deserialize)]
pub struct GenericResponse<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct BlockResponse {
    pub message: BeaconBlockMessage,
}

#[derive(Debug, Deserialize)]
pub struct BeaconBlockMessage {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
    #[serde(with = "quoted_u64")]
    pub proposer_index: u64,
    pub body: BeaconBlockBody,
}

#[derive(Debug, Deserialize)]
pub struct BeaconBlockBody {
    #[serde(default)]
    pub execution_payload: Option<ExecutionPayloadSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionPayloadSummary {
    pub fee_recipient: Address,
    #[serde(with = "quoted_u64")]
    pub block_number: u64,
    pub block_hash: B256,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub withdrawals: Vec<Withdrawal>,
}

#[derive(Debug, Deserialize)]
pub struct FinalityCheckpoints {
    pub finalized: Checkpoint,
}

#[derive(Debug, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "quoted_u64")]
    pub epoch: u64,
}

#[derive(Debug, Deserialize)]
pub struct HeaderResponse {
    pub header: SignedHeader,
}

#[derive(Debug, Deserialize)]
pub struct SignedHeader {
    pub message: HeaderMessage,
}

#[derive(Debug, Deserialize)]
pub struct HeaderMessage {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
}

/*
 * Execution layer
 */

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    #[serde(default, with = "option_hex_u64")]
    pub transaction_index: Option<u64>,
}

impl Transaction {
    pub fn value_wei(&self) -> Result<Wei, Error> {
        u256_to_wei(self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Full(Vec<Transaction>),
    Hashes(Vec<B256>),
}

impl Default for BlockTransactions {
    fn default() -> Self {
        BlockTransactions::Full(vec![])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBlock {
    #[serde(with = "hex_u64")]
    pub number: u64,
    pub hash: B256,
    pub miner: Address,
    pub extra_data: Bytes,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    pub gas_used: U256,
    #[serde(with = "hex_u64")]
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: BlockTransactions,
}

impl ExecutionBlock {
    /// Full transaction objects. Empty if the block was requested without them.
    pub fn transactions(&self) -> &[Transaction] {
        match &self.transactions {
            BlockTransactions::Full(txs) => txs,
            BlockTransactions::Hashes(_) => &[],
        }
    }

    pub fn transaction_hashes(&self) -> Vec<B256> {
        match &self.transactions {
            BlockTransactions::Full(txs) => txs.iter().map(|tx| tx.hash).collect(),
            BlockTransactions::Hashes(hashes) => hashes.clone(),
        }
    }

    pub fn last_transaction(&self) -> Option<&Transaction> {
        self.transactions().last()
    }

    /// `baseFeePerGas * gasUsed`, the part of the transaction fees which is destroyed.
    pub fn burnt_fees(&self) -> Result<Wei, Error> {
        let base_fee = u256_to_wei(self.base_fee_per_gas.unwrap_or_default())?;
        let gas_used = u256_to_wei(self.gas_used)?;
        base_fee
            .checked_mul(gas_used)
            .ok_or_else(|| Error::Overflow(format!("burnt fees of block {}", self.number)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

impl TransactionReceipt {
    /// Fee paid by the sender: `gasUsed * effectiveGasPrice`.
    pub fn fee(&self) -> Result<Wei, Error> {
        u256_to_wei(self.gas_used)?
            .checked_mul(u256_to_wei(self.effective_gas_price)?)
            .ok_or_else(|| Error::Overflow(format!("fee of tx {}", self.transaction_hash)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default, with = "option_hex_u64")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// Parameters of an `eth_getLogs` request over an inclusive block range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Option<Address>,
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<B256>,
}

impl LogFilter {
    pub fn single_block(address: Option<Address>, block_number: u64, topic: B256) -> Self {
        Self {
            address,
            from_block: block_number,
            to_block: block_number,
            topics: vec![topic],
        }
    }

    pub fn matches(&self, log: &Log) -> bool {
        let block_ok = log
            .block_number
            .map_or(true, |n| n >= self.from_block && n <= self.to_block);
        let address_ok = self.address.map_or(true, |a| a == log.address);
        let topics_ok = self
            .topics
            .iter()
            .enumerate()
            .all(|(i, topic)| log.topics.get(i) == Some(topic));
        block_ok && address_ok && topics_ok
    }
}

/// Fees received by the block producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinerData {
    /// Sum of `gasUsed * effectiveGasPrice` over all transactions.
    pub tx_fee: Wei,
    pub coinbase: Address,
    pub extra_data: Bytes,
}

/*
 * MEV relays
 */

/// A payload a relay reports as delivered to a proposer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPayload {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
    pub block_hash: B256,
    pub builder_pubkey: String,
    pub proposer_fee_recipient: Address,
    pub value: U256,
    #[serde(with = "quoted_u64")]
    pub block_number: u64,
}

impl RelayPayload {
    pub fn value_wei(&self) -> Result<Wei, Error> {
        u256_to_wei(self.value)
    }
}

pub mod option_hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => super::hex_u64::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => {
                let digits = s.strip_prefix("0x").unwrap_or(&s);
                u64::from_str_radix(digits, 16)
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_extra_data_like_an_explorer() {
        assert_eq!(decode_extra_data(b""), None);
        assert_eq!(
            decode_extra_data(b"Illuminate Dmocratize Dstribute").as_deref(),
            Some("Illuminate Dmocratize Dstribute")
        );
        // Geth's RLP-encoded version banner contains valid multi-byte sequences.
        let banner = [
            0xd8, 0x83, 0x01, 0x0a, 0x17, b'g', b'e', b't', b'h', b'g', b'o',
        ];
        assert_eq!(
            decode_extra_data(&banner).as_deref(),
            Some("\u{0603}\u{1}\n\u{17}gethgo")
        );
        // Invalid sequences are dropped rather than replaced.
        assert_eq!(decode_extra_data(&[0xff, b'a']).as_deref(), Some("a"));
    }

    #[test]
    fn parses_beacon_block_with_withdrawals() {
        let body = json!({
            "message": {
                "slot": "6209536",
                "proposer_index": "91",
                "body": {
                    "execution_payload": {
                        "fee_recipient": "0x388c818ca8b9251b393131c08a736a67ccb19297",
                        "block_number": "17034870",
                        "block_hash": "0x1c6b3ef0f6b7b1f4ec0be1bd1a6d8d0e5fa3c09e4c2a7cbcc3a1d3df58f7c2e1",
                        "withdrawals": [{
                            "index": "0",
                            "validator_index": "123",
                            "address": "0x8626f6940e2eb28930efb4cef49b2d1f2c9c1199",
                            "amount": "2250393207"
                        }]
                    }
                }
            }
        });
        let block: BlockResponse = serde_json::from_value(body).unwrap();
        let payload = block.message.body.execution_payload.unwrap();
        assert_eq!(payload.block_number, 17_034_870);
        assert_eq!(payload.withdrawals.len(), 1);
        assert_eq!(payload.withdrawals[0].amount_wei(), 2_250_393_207_000_000_000);
    }

    #[test]
    fn pre_merge_block_has_no_payload() {
        let body = json!({
            "message": { "slot": "1", "proposer_index": "2", "body": {} }
        });
        let block: BlockResponse = serde_json::from_value(body).unwrap();
        assert!(block.message.body.execution_payload.is_none());
    }

    #[test]
    fn relay_payload_value_is_a_decimal_string() {
        let payload: RelayPayload = serde_json::from_value(json!({
            "slot": "5000000",
            "block_hash": "0x7a8f1e1b1d36c4e6b73a2a0c02b26a0c6e4f1b1e1bd0b1d56d91b3c4a6c0c9c1",
            "builder_pubkey": "0xa1dead",
            "proposer_fee_recipient": "0xE688B84B23F322A994A53DBF8E15FA82CDB71127",
            "value": "28854222256963892",
            "block_number": "15835292"
        }))
        .unwrap();
        assert_eq!(payload.value_wei().unwrap(), 28_854_222_256_963_892);
        assert_eq!(
            address_to_string(&payload.proposer_fee_recipient),
            "0xe688b84b23f322a994a53dbf8e15fa82cdb71127"
        );
    }

    #[test]
    fn burnt_fees_and_receipt_fees() {
        let block: ExecutionBlock = serde_json::from_value(json!({
            "number": "0xf1a1bc",
            "hash": "0x7a8f1e1b1d36c4e6b73a2a0c02b26a0c6e4f1b1e1bd0b1d56d91b3c4a6c0c9c1",
            "miner": "0xdafea492d9c6733ae3d56b7ed1adb60692c98bc5",
            "extraData": "0x",
            "baseFeePerGas": "0x10",
            "gasUsed": "0x100",
            "timestamp": "0x63680e5b",
            "transactions": []
        }))
        .unwrap();
        assert_eq!(block.burnt_fees().unwrap(), 16 * 256);

        let receipt: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": "0x7a8f1e1b1d36c4e6b73a2a0c02b26a0c6e4f1b1e1bd0b1d56d91b3c4a6c0c9c1",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00"
        }))
        .unwrap();
        assert_eq!(receipt.fee().unwrap(), 21_000 * 1_000_000_000);
    }
}
