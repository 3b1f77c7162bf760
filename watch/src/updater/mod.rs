use crate::builders::{self, BuilderRegistry};
use crate::classifier::{self, BlockRewardClassifier};
use crate::config::Config as FullConfig;
use crate::database::{self, PgStore};
use crate::indexer::{
    self, record_for_classification, BalanceIndexer, BlockRewardsIndexer, WithdrawalsIndexer,
};
use crate::metrics;
use crate::reconcile::Distributors;
use crate::rocket_pool::{self, RocketPoolIndexer};
use crate::store::RewardStore;
use crate::types::BlockRewardRecord;
use chain_clients::{
    beacon::Timeouts, BeaconClient, BeaconNodeHttpClient, ExecutionClient, ExecutionHttpClient,
    RelayClient, RelayHttpClient, SensitiveUrl,
};
use log::{debug, error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

pub use config::{Config, Reindex};

mod config;

#[derive(Debug)]
pub enum Error {
    Client(chain_clients::Error),
    SensitiveUrl(chain_clients::SensitiveError),
    Database(database::Error),
    Registry(builders::Error),
    Indexer(indexer::Error),
    RocketPool(rocket_pool::Error),
    Classifier(classifier::Error),
    Task(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<chain_clients::Error> for Error {
    fn from(e: chain_clients::Error) -> Self {
        Error::Client(e)
    }
}

impl From<chain_clients::SensitiveError> for Error {
    fn from(e: chain_clients::SensitiveError) -> Self {
        Error::SensitiveUrl(e)
    }
}

impl From<database::Error> for Error {
    fn from(e: database::Error) -> Self {
        Error::Database(e)
    }
}

impl From<builders::Error> for Error {
    fn from(e: builders::Error) -> Self {
        Error::Registry(e)
    }
}

impl From<indexer::Error> for Error {
    fn from(e: indexer::Error) -> Self {
        Error::Indexer(e)
    }
}

impl From<rocket_pool::Error> for Error {
    fn from(e: rocket_pool::Error) -> Self {
        Error::RocketPool(e)
    }
}

impl From<classifier::Error> for Error {
    fn from(e: classifier::Error) -> Self {
        Error::Classifier(e)
    }
}

/// The chain data sources named in the config.
pub struct Clients {
    pub beacon: Arc<dyn BeaconClient>,
    pub execution: Arc<dyn ExecutionClient>,
    pub relays: Vec<Arc<dyn RelayClient>>,
}

impl Clients {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let beacon = BeaconNodeHttpClient::new(
            SensitiveUrl::parse(&config.beacon_node_url)?,
            Timeouts::default(),
        );
        let execution = ExecutionHttpClient::new(SensitiveUrl::parse(&config.execution_node_url)?);
        let relays = match &config.relay_urls {
            Some(urls) => urls
                .iter()
                .map(|url| Ok(RelayHttpClient::new(SensitiveUrl::parse(url)?)))
                .collect::<Result<Vec<_>, Error>>()?,
            None => RelayHttpClient::mainnet()?,
        };
        info!("Using beacon node {} and {} relays", beacon, relays.len());

        Ok(Self {
            beacon: Arc::new(beacon),
            execution: Arc::new(execution),
            relays: relays
                .into_iter()
                .map(|relay| Arc::new(relay) as Arc<dyn RelayClient>)
                .collect(),
        })
    }

    pub fn classifier(&self, config: &Config) -> Result<BlockRewardClassifier, Error> {
        let registry = match &config.builder_registry_path {
            Some(path) => BuilderRegistry::load_from_file(path)?,
            None => BuilderRegistry::mainnet()?,
        };
        Ok(BlockRewardClassifier::new(
            self.beacon.clone(),
            self.execution.clone(),
            self.relays.clone(),
            Arc::new(registry),
            Distributors::mainnet()?,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indexer {
    BlockRewards,
    Withdrawals,
    Balances,
    RocketPool,
}

impl Indexer {
    pub fn name(self) -> &'static str {
        match self {
            Indexer::BlockRewards => "block_rewards",
            Indexer::Withdrawals => "withdrawals",
            Indexer::Balances => "balances",
            Indexer::RocketPool => "rocket_pool",
        }
    }
}

/// Owns one instance of every enabled indexer.
pub struct UpdateHandler {
    block_rewards: Option<BlockRewardsIndexer>,
    withdrawals: Option<WithdrawalsIndexer>,
    balances: Option<BalanceIndexer>,
    rocket_pool: Option<RocketPoolIndexer>,
}

impl UpdateHandler {
    pub fn new(
        config: &Config,
        clients: &Clients,
        store: Arc<dyn RewardStore>,
    ) -> Result<Self, Error> {
        let block_rewards = if config.block_rewards {
            let classifier = Arc::new(clients.classifier(config)?);
            Some(
                BlockRewardsIndexer::new(clients.beacon.clone(), classifier, store.clone())
                    .with_cursor(config.reindex.cursor())
                    .with_max_concurrent_slots(config.max_concurrent_slots)
                    .with_start_slot(config.block_rewards_start_slot),
            )
        } else {
            None
        };

        Ok(Self {
            block_rewards,
            withdrawals: config
                .withdrawals
                .then(|| WithdrawalsIndexer::new(clients.beacon.clone(), store.clone())),
            balances: config.balances.then(|| {
                BalanceIndexer::new(
                    clients.beacon.clone(),
                    store.clone(),
                    config.validator_indexes.clone(),
                )
            }),
            rocket_pool: config.rocket_pool.then(|| {
                RocketPoolIndexer::new(
                    clients.beacon.clone(),
                    clients.execution.clone(),
                    store.clone(),
                )
            }),
        })
    }

    pub fn enabled(&self) -> Vec<Indexer> {
        [
            (Indexer::Withdrawals, self.withdrawals.is_some()),
            (Indexer::Balances, self.balances.is_some()),
            (Indexer::RocketPool, self.rocket_pool.is_some()),
            (Indexer::BlockRewards, self.block_rewards.is_some()),
        ]
        .into_iter()
        .filter_map(|(indexer, enabled)| enabled.then_some(indexer))
        .collect()
    }

    pub async fn run_indexer(&self, indexer: Indexer) -> Result<(), Error> {
        match indexer {
            Indexer::BlockRewards => {
                if let Some(block_rewards) = &self.block_rewards {
                    let summary = block_rewards.run().await?;
                    info!(
                        "Block rewards run finished: {} classified, {} missed, {} failed",
                        summary.classified, summary.missed, summary.failed
                    );
                }
            }
            Indexer::Withdrawals => {
                if let Some(withdrawals) = &self.withdrawals {
                    withdrawals.run().await?;
                }
            }
            Indexer::Balances => {
                if let Some(balances) = &self.balances {
                    balances.run().await?;
                }
            }
            Indexer::RocketPool => {
                if let Some(rocket_pool) = &self.rocket_pool {
                    rocket_pool.run().await?;
                }
            }
        }
        Ok(())
    }

    /// Runs `indexer` and logs any error instead of returning it.
    pub async fn run_logged(&self, indexer: Indexer) {
        debug!("Running the {} indexer", indexer.name());
        if let Err(e) = self.run_indexer(indexer).await {
            error!("The {} indexer failed: {:?}", indexer.name(), e);
            metrics::inc_counter_vec(&metrics::UPDATER_RUN_FAILURES, &[indexer.name()]);
        }
    }

    /// Runs every enabled indexer once, one after another.
    pub async fn run_once(&self) {
        for indexer in self.enabled() {
            self.run_logged(indexer).await;
        }
    }
}

/// Runs every enabled indexer in its own loop until the process is stopped. A long block reward
/// backfill does not delay the other indexers.
pub async fn run_updater(config: FullConfig) -> Result<(), Error> {
    let clients = Clients::from_config(&config.updater)?;
    let store: Arc<dyn RewardStore> = Arc::new(PgStore::connect(&config.database)?);
    let handler = Arc::new(UpdateHandler::new(&config.updater, &clients, store)?);
    let period = Duration::from_secs(config.updater.update_period_seconds.max(1));

    let mut tasks = JoinSet::new();
    for indexer in handler.enabled() {
        let handler = handler.clone();
        tasks.spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                handler.run_logged(indexer).await;
            }
        });
    }
    info!("Updater started with {} indexers", tasks.len());

    tokio::select! {
        result = tasks.join_next() => match result {
            Some(Err(e)) => Err(Error::Task(e.to_string())),
            _ => Ok(()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down the updater");
            tasks.abort_all();
            Ok(())
        }
    }
}

/// Classifies the block reward of one slot without storing it.
pub async fn classify_slot(config: &Config, slot: u64) -> Result<BlockRewardRecord, Error> {
    let clients = Clients::from_config(config)?;
    let classifier = clients.classifier(config)?;
    let data = clients.beacon.get_slot_proposer_data(slot).await?;
    if data.block_number.is_none() {
        return Ok(BlockRewardRecord::missed(slot));
    }
    let classification = classifier.classify(&data).await?;
    info!(
        "Slot {} matched strategy {:?}",
        slot, classification.strategy
    );
    Ok(record_for_classification(&data, &classification))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chain_clients::test_utils::{MockBeaconClient, MockExecutionClient};
    use chain_clients::{Address, Withdrawal};

    fn clients(beacon: Arc<MockBeaconClient>) -> Clients {
        Clients {
            beacon,
            execution: Arc::new(MockExecutionClient::new()),
            relays: vec![],
        }
    }

    #[test]
    fn disabled_indexers_are_not_built() {
        let config = Config {
            block_rewards: false,
            rocket_pool: false,
            ..Config::default()
        };
        let handler = UpdateHandler::new(
            &config,
            &clients(Arc::new(MockBeaconClient::new())),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert_eq!(
            handler.enabled(),
            vec![Indexer::Withdrawals, Indexer::Balances]
        );
    }

    #[tokio::test]
    async fn failing_indexers_do_not_stop_the_others() {
        let beacon = Arc::new(MockBeaconClient::new());
        let store = Arc::new(MemoryStore::new());
        beacon.set_head(7_000_000, 200_000);
        beacon.add_withdrawal(Withdrawal {
            slot: 6_209_540,
            validator_index: 3,
            address: Address::repeat_byte(3),
            amount_gwei: 1_000,
        });
        let config = Config {
            block_rewards: false,
            rocket_pool: false,
            ..Config::default()
        };
        let handler = UpdateHandler::new(&config, &clients(beacon), store.clone()).unwrap();

        // No balances are known for slot 0, so the balance indexer fails.
        assert!(handler.run_indexer(Indexer::Balances).await.is_err());
        handler.run_once().await;
        assert_eq!(store.highest_withdrawal_slot().unwrap(), Some(6_209_540));
    }
}
