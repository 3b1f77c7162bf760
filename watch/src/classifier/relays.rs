use chain_clients::{Error, RelayClient, RelayPayload, B256};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use std::sync::Arc;

/// Errors which mean the relay is unavailable rather than that its answer is wrong.
fn is_unavailable(e: &Error) -> bool {
    matches!(
        e,
        Error::StatusCode(_) | Error::RateLimited | Error::Unreachable(_)
    )
}

/// Asks every relay for the payload it delivered for `block_hash` and returns the first payload
/// any of them reports.
///
/// The requests run concurrently. Once a relay answers with a payload the remaining requests are
/// dropped, which cancels them. Unavailable relays are skipped.
pub async fn first_delivered_payload(
    relays: &[Arc<dyn RelayClient>],
    block_hash: B256,
) -> Result<Option<RelayPayload>, Error> {
    let mut requests = relays
        .iter()
        .map(|relay| async move { (relay.name(), relay.get_payload(block_hash).await) })
        .collect::<FuturesUnordered<_>>();

    while let Some((name, result)) = requests.next().await {
        match result {
            Ok(Some(payload)) => {
                debug!("Relay {} delivered block {}", name, block_hash);
                return Ok(Some(payload));
            }
            Ok(None) => (),
            Err(e) if is_unavailable(&e) => {
                warn!("Skipping relay {} for block {}: {}", name, block_hash, e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}
