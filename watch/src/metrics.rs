pub use watch_metrics::*;
use std::sync::LazyLock;

/*
 * Block rewards indexing
 */
pub static SLOTS_WITH_MISSING_BLOCK_REWARDS: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "slots_with_missing_block_rewards",
        "Slots for which block rewards still need to be indexed and stored",
    )
});
pub static SLOTS_INDEXING_FAILURES: LazyLock<Result<IntCounter>> = LazyLock::new(|| {
    try_create_int_counter(
        "slots_indexing_failures_total",
        "Count of slots whose block reward could not be classified",
    )
});
pub static BLOCK_REWARDS_NOT_PROCESSED_OK: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "block_rewards_not_processed_ok",
        "Stored block rewards which need manual inspection",
    )
});
pub static SLOT_BEING_INDEXED: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "slot_being_indexed",
        "The slot whose block reward was most recently started",
    )
});
pub static BLOCK_CLASSIFICATIONS: LazyLock<Result<IntCounterVec>> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "block_classifications_total",
        "Count of classified blocks by the strategy that matched, or the error raised",
        &["outcome"],
    )
});
pub static BLOCK_CLASSIFICATION_TIMES: LazyLock<Result<Histogram>> = LazyLock::new(|| {
    try_create_histogram(
        "block_classification_seconds",
        "Time taken to classify the block reward of one slot",
    )
});

/*
 * Other indexers
 */
pub static WITHDRAWALS_INDEXED: LazyLock<Result<IntCounter>> = LazyLock::new(|| {
    try_create_int_counter(
        "withdrawals_indexed_total",
        "Count of withdrawals stored",
    )
});
pub static BALANCES_INDEXED: LazyLock<Result<IntCounter>> = LazyLock::new(|| {
    try_create_int_counter(
        "balances_indexed_total",
        "Count of validator balance snapshots stored",
    )
});
pub static ROCKET_POOL_MINIPOOLS: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "rocket_pool_minipools",
        "Number of known Rocket Pool minipools",
    )
});
pub static UPDATER_RUN_FAILURES: LazyLock<Result<IntCounterVec>> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "updater_run_failures_total",
        "Count of updater runs which ended in an error",
        &["indexer"],
    )
});
