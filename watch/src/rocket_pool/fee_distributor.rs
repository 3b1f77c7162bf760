//! The node operator's share of execution layer rewards paid to a node fee distributor.

use super::splitter::{operator_share, FULL_BOND_WEI};
use super::Error;
use chain_clients::{u256_to_wei, Address, Bytes, ExecutionClient, Wei, U256};
use log::debug;

/// `RocketStorage`, which resolves the current address of every Rocket Pool contract.
pub const ROCKET_STORAGE_ADDRESS: &str = "0x1d8f8f00cfa6758d7be78336684788fb0ee0fa46";
/// `keccak256("contract.address" ++ "rocketNodeManager")`.
pub const NODE_MANAGER_STORAGE_KEY: &str =
    "af00be55c9fb8f543c04e0aa0d70351b880c1bfafffd15b60065a4a50c85ec94";

/// `getNodeShare()`
const GET_NODE_SHARE: [u8; 4] = [0x37, 0x2d, 0x05, 0x4b];
/// `getAddress(bytes32)`
const GET_ADDRESS: [u8; 4] = [0x21, 0xf8, 0xa7, 0x21];
/// `getAverageNodeFee(address)`
const GET_AVERAGE_NODE_FEE: [u8; 4] = [0x41, 0x4d, 0xd1, 0xd2];

/// Distributors deployed before `getNodeShare` existed split rewards as if every minipool had a
/// 16 ETH bond.
const LEGACY_BOND_WEI: Wei = FULL_BOND_WEI / 2;

/// `selector` followed by the ABI encoding of `address`.
pub fn call_with_address(selector: [u8; 4], address: Address) -> Bytes {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&selector);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(address.as_slice());
    data.into()
}

pub fn decode_uint(result: &[u8]) -> Result<Wei, Error> {
    let word = result.get(..32).ok_or_else(|| {
        Error::InvalidCallResult(format!("expected a 32 byte word, got {} bytes", result.len()))
    })?;
    Ok(u256_to_wei(U256::from_be_slice(word))?)
}

/// An address returned as the last 20 bytes of a 32 byte word starting at `offset`.
pub fn decode_address(result: &[u8], offset: usize) -> Result<Address, Error> {
    result
        .get(offset + 12..offset + 32)
        .map(Address::from_slice)
        .ok_or_else(|| {
            Error::InvalidCallResult(format!(
                "no address at offset {} of {} bytes",
                offset,
                result.len()
            ))
        })
}

fn parse_address(s: &str) -> Result<Address, Error> {
    s.parse()
        .map_err(|e| Error::InvalidCallResult(format!("invalid address {}: {:?}", s, e)))
}

/// The part of the rewards `distributor` received in `block_number` which belongs to `node`.
///
/// Current distributors report the node share of their balance, so the share of the block's
/// reward is the change of that figure. Older distributors revert on that call. For them the
/// distributor's balance delta is split with the node's average fee at that block.
pub async fn node_share_of_block_reward(
    execution: &dyn ExecutionClient,
    distributor: Address,
    node: Address,
    block_number: u64,
) -> Result<Wei, Error> {
    let previous_block = block_number.saturating_sub(1);
    let call = Bytes::from(GET_NODE_SHARE.to_vec());

    match execution
        .eth_call(distributor, call.clone(), Some(block_number))
        .await
    {
        Ok(after) => {
            let before = execution
                .eth_call(distributor, call, Some(previous_block))
                .await?;
            Ok(decode_uint(&after)? - decode_uint(&before)?)
        }
        Err(chain_clients::Error::ServerMessage { code, message }) => {
            debug!(
                "Distributor {} has no node share at block {} ({}: {}), using the average fee",
                distributor, block_number, code, message
            );
            legacy_node_share(execution, distributor, node, block_number).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn legacy_node_share(
    execution: &dyn ExecutionClient,
    distributor: Address,
    node: Address,
    block_number: u64,
) -> Result<Wei, Error> {
    let delta = execution.get_balance(distributor, block_number).await?
        - execution
            .get_balance(distributor, block_number.saturating_sub(1))
            .await?;

    let node_manager = node_manager_at(execution, block_number).await?;
    let average_fee = decode_uint(
        &execution
            .eth_call(
                node_manager,
                call_with_address(GET_AVERAGE_NODE_FEE, node),
                Some(block_number),
            )
            .await?,
    )?;

    Ok(operator_share(delta, LEGACY_BOND_WEI, average_fee))
}

/// The `RocketNodeManager` deployment active at `block_number`.
pub async fn node_manager_at(
    execution: &dyn ExecutionClient,
    block_number: u64,
) -> Result<Address, Error> {
    let key = hex::decode(NODE_MANAGER_STORAGE_KEY)
        .map_err(|e| Error::InvalidCallResult(format!("invalid storage key: {:?}", e)))?;
    let mut data = GET_ADDRESS.to_vec();
    data.extend_from_slice(&key);

    let result = execution
        .eth_call(
            parse_address(ROCKET_STORAGE_ADDRESS)?,
            data.into(),
            Some(block_number),
        )
        .await?;
    decode_address(&result, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_clients::test_utils::MockExecutionClient;
    use chain_clients::WEI_PER_ETH;

    fn word(value: u128) -> Bytes {
        U256::from(value).to_be_bytes::<32>().to_vec().into()
    }

    fn address_word(address: Address) -> Bytes {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(address.as_slice());
        data.into()
    }

    #[tokio::test]
    async fn node_share_from_distributor() {
        let execution = MockExecutionClient::new();
        let distributor = Address::repeat_byte(0xd1);
        let call = Bytes::from(GET_NODE_SHARE.to_vec());
        execution.set_call(distributor, call.clone(), Some(99), word(1_000));
        execution.set_call(distributor, call, Some(100), word(1_600));

        let share = node_share_of_block_reward(&execution, distributor, Address::ZERO, 100)
            .await
            .unwrap();
        assert_eq!(share, 600);
    }

    #[tokio::test]
    async fn legacy_distributor_uses_average_fee() {
        let execution = MockExecutionClient::new();
        let distributor = Address::repeat_byte(0xd1);
        let node = Address::repeat_byte(0x0e);
        let node_manager = Address::repeat_byte(0x4a);

        execution.set_balance(distributor, 99, WEI_PER_ETH);
        execution.set_balance(distributor, 100, 2 * WEI_PER_ETH);

        let mut storage_call = GET_ADDRESS.to_vec();
        storage_call.extend_from_slice(&hex::decode(NODE_MANAGER_STORAGE_KEY).unwrap());
        execution.set_call(
            ROCKET_STORAGE_ADDRESS.parse().unwrap(),
            storage_call.into(),
            Some(100),
            address_word(node_manager),
        );
        execution.set_call(
            node_manager,
            call_with_address(GET_AVERAGE_NODE_FEE, node),
            Some(100),
            word(15 * WEI_PER_ETH as u128 / 100),
        );

        // Half of 1 ETH plus 15% commission on the other half.
        let share = node_share_of_block_reward(&execution, distributor, node, 100)
            .await
            .unwrap();
        assert_eq!(share, 575_000_000_000_000_000);
    }

    #[test]
    fn address_encoding() {
        let address = Address::repeat_byte(0xab);
        let data = call_with_address(GET_AVERAGE_NODE_FEE, address);
        assert_eq!(data.len(), 36);
        assert_eq!(decode_address(&data[4..], 0).unwrap(), address);
        assert!(decode_uint(&[0u8; 31]).is_err());
    }
}
