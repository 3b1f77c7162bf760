pub use watch_metrics::*;
use std::sync::LazyLock;

pub const BEACON: &str = "beacon";
pub const EXECUTION: &str = "execution";
pub const RELAY: &str = "relay";

pub static CHAIN_CLIENT_REQUESTS: LazyLock<Result<IntCounterVec>> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "chain_client_requests_total",
        "Count of requests sent to chain data providers",
        &["client", "method"],
    )
});
pub static CHAIN_CLIENT_RETRIES: LazyLock<Result<IntCounterVec>> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "chain_client_retries_total",
        "Count of requests retried after a transient failure",
        &["client"],
    )
});
