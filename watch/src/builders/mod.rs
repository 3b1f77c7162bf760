//! Static reference data about MEV builders and the addresses which need special treatment when
//! attributing block rewards.
//!
//! The data lives in `builders.yaml`, which is compiled into the binary. An operator can point
//! `registry_path` in the config at a newer copy of the file without rebuilding.

use chain_clients::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

const DEFAULT_REGISTRY: &str = include_str!("builders.yaml");

/// How a builder hands the block's value over to the proposer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStrategy {
    /// The builder is the fee recipient and pays the proposer in the last transaction of the
    /// block.
    LastTx,
    /// The proposer is the fee recipient and the builder pays it through `COINBASE`.
    Direct,
    /// The proposer is the fee recipient and receives the payment through internal transactions,
    /// which do not show up in the transaction list.
    ContractCallInternalTxs,
    /// The fee recipient is a contract which splits the value between builder and proposer.
    ContractDistributor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    pub name: String,
    pub fee_recipient: Option<Address>,
    pub payout: PayoutStrategy,
    /// Decoded extra data values seen in this builder's blocks. `None` is a block without extra
    /// data.
    pub extra_data: Vec<Option<String>>,
}

impl Builder {
    pub fn signs(&self, extra_data: Option<&str>) -> bool {
        self.extra_data.iter().any(|value| value.as_deref() == extra_data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableRelay {
    pub name: String,
    #[serde(default)]
    pub extra_data: Vec<String>,
    #[serde(default)]
    pub slots: Vec<u64>,
}

/// The on-disk layout of the registry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryData {
    #[serde(default)]
    pub builders: Vec<Builder>,
    #[serde(default)]
    pub common_extra_data_substrings: Vec<String>,
    #[serde(default)]
    pub forwarder_recipients: Vec<Address>,
    #[serde(default)]
    pub mev_refunders: Vec<Address>,
    #[serde(default)]
    pub mev_bot_contracts: Vec<Address>,
    #[serde(default)]
    pub unreachable_relays: Vec<UnreachableRelay>,
    #[serde(default)]
    pub spam_senders: Vec<Address>,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    DuplicateFeeRecipient(Address),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(e)
    }
}

/// Lookup tables built once from `RegistryData`. Performs no I/O after construction.
#[derive(Debug)]
pub struct BuilderRegistry {
    builders: Vec<Builder>,
    by_fee_recipient: HashMap<Address, usize>,
    common_substrings: Vec<String>,
    forwarders: HashSet<Address>,
    mev_refunders: HashSet<Address>,
    mev_bot_contracts: HashSet<Address>,
    unreachable_relay_slots: HashSet<u64>,
    unreachable_relay_extra_data: HashSet<String>,
    spam_senders: HashSet<Address>,
}

impl BuilderRegistry {
    pub fn mainnet() -> Result<Self, Error> {
        Self::from_yaml(DEFAULT_REGISTRY)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let data: RegistryData = serde_yaml::from_reader(file)?;
        Self::new(data)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Self::new(serde_yaml::from_str(yaml)?)
    }

    pub fn new(data: RegistryData) -> Result<Self, Error> {
        let mut by_fee_recipient = HashMap::new();
        let mut builders: Vec<Builder> = vec![];

        for builder in data.builders {
            if let Some(fee_recipient) = builder.fee_recipient {
                // The same builder may be listed under several names with more signatures.
                if let Some(&existing) = by_fee_recipient.get(&fee_recipient) {
                    let known: &mut Builder = &mut builders[existing];
                    if known.payout != builder.payout {
                        return Err(Error::DuplicateFeeRecipient(fee_recipient));
                    }
                    known.extra_data.extend(builder.extra_data);
                    continue;
                }
                by_fee_recipient.insert(fee_recipient, builders.len());
            }
            builders.push(builder);
        }

        let unreachable_relay_slots = data
            .unreachable_relays
            .iter()
            .flat_map(|relay| relay.slots.iter().copied())
            .collect();
        let unreachable_relay_extra_data = data
            .unreachable_relays
            .into_iter()
            .flat_map(|relay| relay.extra_data)
            .collect();

        Ok(Self {
            builders,
            by_fee_recipient,
            common_substrings: data.common_extra_data_substrings,
            forwarders: data.forwarder_recipients.into_iter().collect(),
            mev_refunders: data.mev_refunders.into_iter().collect(),
            mev_bot_contracts: data.mev_bot_contracts.into_iter().collect(),
            unreachable_relay_slots,
            unreachable_relay_extra_data,
            spam_senders: data.spam_senders.into_iter().collect(),
        })
    }

    /// The builder which uses `fee_recipient` as its own fee recipient.
    pub fn classify(&self, fee_recipient: &Address) -> Option<&Builder> {
        self.by_fee_recipient
            .get(fee_recipient)
            .map(|&index| &self.builders[index])
    }

    pub fn is_builder_fee_recipient(&self, address: &Address) -> bool {
        self.by_fee_recipient.contains_key(address)
    }

    /// The first builder without its own fee recipient whose signature is `extra_data` and which
    /// pays out with `payout`.
    ///
    /// Common client banners never match, even if a builder lists one.
    pub fn builder_for_extra_data(
        &self,
        extra_data: Option<&str>,
        payout: PayoutStrategy,
    ) -> Option<&Builder> {
        let extra_data = extra_data?;
        if self.is_common_extra_data(extra_data) {
            return None;
        }
        self.builders.iter().find(|builder| {
            builder.fee_recipient.is_none()
                && builder.payout == payout
                && builder.signs(Some(extra_data))
        })
    }

    /// `true` for extra data shared by many unrelated blocks, such as geth version banners.
    pub fn is_common_extra_data(&self, extra_data: &str) -> bool {
        self.common_substrings
            .iter()
            .any(|substring| extra_data.contains(substring.as_str()))
    }

    /// `true` if `extra_data` is a signature of any known builder.
    pub fn is_known_signature(&self, extra_data: Option<&str>) -> bool {
        self.builders.iter().any(|builder| builder.signs(extra_data))
    }

    /// `true` for extra data which is neither a known builder signature nor common noise. Such a
    /// block paying out like a builder hints at a builder missing from the registry.
    pub fn is_uncommon_extra_data(&self, extra_data: Option<&str>) -> bool {
        match extra_data {
            Some(value) => !self.is_common_extra_data(value) && !self.is_known_signature(extra_data),
            None => false,
        }
    }

    pub fn is_forwarder(&self, address: &Address) -> bool {
        self.forwarders.contains(address)
    }

    pub fn is_mev_refunder(&self, address: &Address) -> bool {
        self.mev_refunders.contains(address)
    }

    pub fn is_mev_bot_contract(&self, address: &Address) -> bool {
        self.mev_bot_contracts.contains(address)
    }

    /// `true` if the block was delivered by a relay which can no longer be queried.
    pub fn delivered_by_unreachable_relay(&self, slot: u64, extra_data: Option<&str>) -> bool {
        self.unreachable_relay_slots.contains(&slot)
            || extra_data.is_some_and(|value| self.unreachable_relay_extra_data.contains(value))
    }

    pub fn is_spam_sender(&self, address: &Address) -> bool {
        self.spam_senders.contains(address)
    }

    pub fn builders(&self) -> &[Builder] {
        &self.builders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_clients::decode_extra_data;
    use std::str::FromStr;

    fn address(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    #[test]
    fn mainnet_registry_loads() {
        let registry = BuilderRegistry::mainnet().unwrap();
        let flashbots = registry
            .classify(&address("0xdafea492d9c6733ae3d56b7ed1adb60692c98bc5"))
            .unwrap();
        assert_eq!(flashbots.payout, PayoutStrategy::LastTx);
        assert!(flashbots.signs(Some("Illuminate Dmocratize Dstribute")));
        assert!(registry
            .classify(&address("0xe688b84b23f322a994a53dbf8e15fa82cdb71127"))
            .is_none());
    }

    #[test]
    fn duplicate_entries_merge_signatures() {
        let registry = BuilderRegistry::mainnet().unwrap();
        let builder = registry
            .classify(&address("0x8d5998a27b3cdf33479b65b18f075e20a7aa05b9"))
            .unwrap();
        assert!(builder.signs(None));
        assert!(builder.signs(Some("\u{0603}\u{1}\u{b}\u{0}gethgo1.19.1linux")));
    }

    #[test]
    fn conflicting_duplicates_are_rejected() {
        let yaml = r#"
builders:
  - name: a
    fee_recipient: "0x1111111111111111111111111111111111111111"
    payout: LAST_TX
    extra_data: [~]
  - name: b
    fee_recipient: "0x1111111111111111111111111111111111111111"
    payout: DIRECT
    extra_data: [~]
"#;
        assert!(matches!(
            BuilderRegistry::from_yaml(yaml),
            Err(Error::DuplicateFeeRecipient(_))
        ));
    }

    #[test]
    fn geth_banners_are_common_not_builders() {
        let registry = BuilderRegistry::mainnet().unwrap();
        let banner = decode_extra_data(&[
            0xd8, 0x83, 0x01, 0x0a, 0x17, b'g', b'e', b't', b'h', b'g', b'o', b'1', b'.', b'1',
            b'8', b'.', b'5', b'l', b'i', b'n', b'u', b'x',
        ])
        .unwrap();
        assert!(registry.is_common_extra_data(&banner));
        assert!(!registry.is_uncommon_extra_data(Some(&banner)));
        assert!(registry
            .builder_for_extra_data(Some(&banner), PayoutStrategy::Direct)
            .is_none());
        // The banner still identifies builder0x69 when it is the fee recipient.
        assert!(registry
            .classify(&address("0x690b9a9e9aa1c9db991c7721a92d351db4fac990"))
            .unwrap()
            .signs(Some(&banner)));
    }

    #[test]
    fn extra_data_signatures() {
        let registry = BuilderRegistry::mainnet().unwrap();
        assert_eq!(
            registry
                .builder_for_extra_data(Some("Manifold"), PayoutStrategy::Direct)
                .map(|b| b.name.as_str()),
            Some("Manifold")
        );
        assert_eq!(
            registry
                .builder_for_extra_data(
                    Some("Powered by bloXroute"),
                    PayoutStrategy::ContractCallInternalTxs
                )
                .map(|b| b.name.as_str()),
            Some("bloXroute external builder")
        );
        assert!(registry
            .builder_for_extra_data(None, PayoutStrategy::Direct)
            .is_none());
        assert!(registry.is_uncommon_extra_data(Some("hello from a new builder")));
        assert!(!registry.is_uncommon_extra_data(Some("Manifold")));
        assert!(!registry.is_uncommon_extra_data(None));
    }

    #[test]
    fn special_addresses() {
        let registry = BuilderRegistry::mainnet().unwrap();
        assert!(registry.is_forwarder(&address("0x7cd1af7d5299c5bfd4a63291eb5aa57f0ce60024")));
        assert!(registry.is_mev_refunder(&address("0xc13ced137e90bc695cb77288962280516a2f9b8b")));
        assert!(registry.is_spam_sender(&address("0x994e092c13aa50d312643b5caa0273317b664f5d")));
        assert!(registry.delivered_by_unreachable_relay(5_246_635, None));
        assert!(registry.delivered_by_unreachable_relay(1, Some("Viva relayooor.wtf")));
        assert!(!registry.delivered_by_unreachable_relay(1, Some("Manifold")));
        assert_eq!(
            registry
                .classify(&address("0x7d00a2bc1370b9005eb100004da500924600a2e1"))
                .map(|b| b.payout),
            Some(PayoutStrategy::ContractDistributor)
        );
    }
}
