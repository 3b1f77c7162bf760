use crate::rocket_pool::{BondReduction, Minipool, RocketPoolNode};
use crate::store::RewardStore;
use crate::types::{BalanceSnapshot, BlockRewardRecord};
use chain_clients::{address_to_string, Address, Withdrawal};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{Builder, ConnectionManager, Pool, PooledConnection};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub use self::error::Error;
pub use self::models::{
    WatchBalance, WatchBlockReward, WatchBondReduction, WatchMinipool, WatchRocketPoolNode,
    WatchWithdrawal,
};
use self::models::{to_i64, to_u64};
use self::schema::{
    balances, block_rewards, rocket_pool_bond_reductions, rocket_pool_minipools,
    rocket_pool_nodes, withdrawal_addresses, withdrawals,
};

pub use config::Config;

mod config;
mod error;

pub mod models;
pub mod schema;
pub mod utils;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Postgres accepts at most 65535 bind parameters per statement.
const MAX_ROWS_PER_INSERT: usize = 10_000;

/// Connect to a Postgresql database and build a connection pool.
pub fn build_connection_pool(config: &Config) -> Result<PgPool, Error> {
    info!(
        "Building connection pool at: {}",
        config.redacted_database_url()
    );
    let pg = ConnectionManager::<PgConnection>::new(config.build_database_url());
    Builder::new()
        .max_size(config.max_connections)
        .connection_timeout(Duration::from_millis(config.connect_timeout_millis))
        .build(pg)
        .map_err(Error::Pool)
}

/// Retrieve an idle connection from the pool.
pub fn get_connection(pool: &PgPool) -> Result<PgConn, Error> {
    pool.get().map_err(Error::Pool)
}

///
/// INSERT statements
///

/// Inserts a single row into the `block_rewards` table.
///
/// On a conflict, the stored row is replaced. Re-classifying a slot must overwrite a previous
/// failure.
pub fn upsert_block_reward(conn: &mut PgConn, record: &BlockRewardRecord) -> Result<(), Error> {
    use self::block_rewards::dsl::*;

    let row = WatchBlockReward::from(record);
    diesel::insert_into(block_rewards)
        .values(&row)
        .on_conflict(slot)
        .do_update()
        .set(&row)
        .execute(conn)?;

    debug!(
        "Block reward upserted, slot: {}, processed_ok: {}",
        row.slot, row.processed_ok
    );
    Ok(())
}

/// Returns the id of `address` in the `withdrawal_addresses` table, inserting it if required.
pub fn insert_withdrawal_address(conn: &mut PgConn, address: &Address) -> Result<i32, Error> {
    use self::withdrawal_addresses::dsl::{address as address_column, id, withdrawal_addresses};

    let address = address_to_string(address);
    diesel::insert_into(withdrawal_addresses)
        .values(address_column.eq(&address))
        .on_conflict(address_column)
        .do_nothing()
        .execute(conn)?;

    let address_id = withdrawal_addresses
        .select(id)
        .filter(address_column.eq(&address))
        .first::<i32>(conn)?;

    Ok(address_id)
}

/// Insert a batch of values into the `withdrawals` table.
///
/// On a conflict, it will do nothing, leaving the old value.
pub fn insert_batch_withdrawals(
    conn: &mut PgConn,
    new_withdrawals: &[Withdrawal],
) -> Result<(), Error> {
    use self::withdrawals::dsl::*;

    conn.transaction::<_, Error, _>(|conn| {
        let mut address_ids: HashMap<Address, i32> = HashMap::new();
        let mut rows = Vec::with_capacity(new_withdrawals.len());
        for withdrawal in new_withdrawals {
            let address_id = match address_ids.get(&withdrawal.address) {
                Some(address_id) => *address_id,
                None => {
                    let address_id = insert_withdrawal_address(conn, &withdrawal.address)?;
                    address_ids.insert(withdrawal.address, address_id);
                    address_id
                }
            };
            rows.push(WatchWithdrawal::new(withdrawal, address_id));
        }

        let mut count = 0;
        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            count += diesel::insert_into(withdrawals)
                .values(chunk)
                .on_conflict_do_nothing()
                .execute(conn)?;
        }

        debug!("Withdrawals inserted, count: {}", count);
        Ok(())
    })
}

/// Insert a batch of values into the `balances` table.
///
/// On a conflict, it will do nothing, leaving the old value.
pub fn insert_batch_balances(
    conn: &mut PgConn,
    snapshots: &[BalanceSnapshot],
) -> Result<(), Error> {
    use self::balances::dsl::*;

    let rows: Vec<WatchBalance> = snapshots.iter().map(WatchBalance::from).collect();
    let mut count = 0;
    for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
        count += diesel::insert_into(balances)
            .values(chunk)
            .on_conflict_do_nothing()
            .execute(conn)?;
    }

    debug!("Balances inserted, count: {}", count);
    Ok(())
}

/// Inserts a single row into the `rocket_pool_nodes` table, replacing the fee distributor of a
/// known node.
pub fn upsert_rocket_pool_node(conn: &mut PgConn, node: &RocketPoolNode) -> Result<(), Error> {
    use self::rocket_pool_nodes::dsl::*;

    let row = WatchRocketPoolNode::from(node);
    diesel::insert_into(rocket_pool_nodes)
        .values(&row)
        .on_conflict(node_address)
        .do_update()
        .set(&row)
        .execute(conn)?;

    debug!("Rocket Pool node upserted: {}", row.node_address);
    Ok(())
}

/// Inserts a single row into the `rocket_pool_minipools` table.
///
/// On a conflict the row is replaced, which fills in validator indexes of minipools that were not
/// yet active when first seen.
pub fn upsert_minipool(conn: &mut PgConn, minipool: &Minipool) -> Result<(), Error> {
    use self::rocket_pool_minipools::dsl::*;

    let row = WatchMinipool::from(minipool);
    diesel::insert_into(rocket_pool_minipools)
        .values(&row)
        .on_conflict(minipool_address)
        .do_update()
        .set(&row)
        .execute(conn)?;

    debug!("Minipool upserted: {}", row.minipool_address);
    Ok(())
}

/// Inserts a single row into the `rocket_pool_bond_reductions` table.
///
/// On a conflict, it will do nothing, leaving the old value.
pub fn insert_bond_reduction(conn: &mut PgConn, reduction: &BondReduction) -> Result<(), Error> {
    use self::rocket_pool_bond_reductions::dsl::*;

    let row = WatchBondReduction::from(reduction);
    diesel::insert_into(rocket_pool_bond_reductions)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)?;

    debug!(
        "Bond reduction inserted, minipool: {}, at: {}",
        row.minipool_address, row.reduced_at
    );
    Ok(())
}

///
/// SELECT statements
///

/// Selects a single row of the `block_rewards` table corresponding to a given `slot_query`.
pub fn get_block_reward_by_slot(
    conn: &mut PgConn,
    slot_query: u64,
) -> Result<Option<BlockRewardRecord>, Error> {
    use self::block_rewards::dsl::*;

    let result = block_rewards
        .filter(slot.eq(to_i64(slot_query)))
        .select(WatchBlockReward::as_select())
        .first::<WatchBlockReward>(conn)
        .optional()?;

    result.map(BlockRewardRecord::try_from).transpose()
}

/// Selects every slot between `min_slot` and `max_slot` (inclusive) present in the
/// `block_rewards` table.
pub fn get_block_reward_slots(
    conn: &mut PgConn,
    min_slot: u64,
    max_slot: u64,
) -> Result<HashSet<u64>, Error> {
    use self::block_rewards::dsl::*;

    let result = block_rewards
        .select(slot)
        .filter(slot.ge(to_i64(min_slot)))
        .filter(slot.le(to_i64(max_slot)))
        .load::<i64>(conn)?;

    result.into_iter().map(to_u64).collect()
}

/// Selects the rows of the `block_rewards` table proposed by any of `proposers` between
/// `min_slot` and `max_slot` (inclusive), ordered by slot.
pub fn get_block_rewards_in_range(
    conn: &mut PgConn,
    min_slot: u64,
    max_slot: u64,
    proposers: &[u64],
) -> Result<Vec<BlockRewardRecord>, Error> {
    use self::block_rewards::dsl::*;

    let proposers: Vec<i64> = proposers.iter().copied().map(to_i64).collect();
    let result = block_rewards
        .filter(slot.ge(to_i64(min_slot)))
        .filter(slot.le(to_i64(max_slot)))
        .filter(proposer_index.eq_any(proposers))
        .order_by(slot.asc())
        .select(WatchBlockReward::as_select())
        .load::<WatchBlockReward>(conn)?;

    result.into_iter().map(BlockRewardRecord::try_from).collect()
}

/// Selects every row of the `block_rewards` table which was not processed ok.
pub fn get_failed_block_rewards(conn: &mut PgConn) -> Result<Vec<BlockRewardRecord>, Error> {
    use self::block_rewards::dsl::*;

    let result = block_rewards
        .filter(processed_ok.eq(false))
        .order_by(slot.asc())
        .select(WatchBlockReward::as_select())
        .load::<WatchBlockReward>(conn)?;

    result.into_iter().map(BlockRewardRecord::try_from).collect()
}

/// Selects the withdrawals of `validators` between `min_slot` and `max_slot` (inclusive), joined
/// with their withdrawal address.
pub fn get_withdrawals_for_validators(
    conn: &mut PgConn,
    validators: &[u64],
    min_slot: u64,
    max_slot: u64,
) -> Result<Vec<Withdrawal>, Error> {
    use self::withdrawals::dsl::*;

    let validators: Vec<i64> = validators.iter().copied().map(to_i64).collect();
    let result = withdrawals
        .inner_join(withdrawal_addresses::table)
        .filter(slot.ge(to_i64(min_slot)))
        .filter(slot.le(to_i64(max_slot)))
        .filter(validator_index.eq_any(validators))
        .order_by((slot.asc(), validator_index.asc()))
        .select((WatchWithdrawal::as_select(), withdrawal_addresses::address))
        .load::<(WatchWithdrawal, String)>(conn)?;

    result
        .into_iter()
        .map(|(row, address)| row.into_withdrawal(&address))
        .collect()
}

/// Selects the highest slot in the `withdrawals` table.
pub fn get_highest_withdrawal_slot(conn: &mut PgConn) -> Result<Option<u64>, Error> {
    use self::withdrawals::dsl::*;

    let result = withdrawals
        .select(diesel::dsl::max(slot))
        .first::<Option<i64>>(conn)?;

    result.map(to_u64).transpose()
}

/// Selects the balances of `validators` between `min_slot` and `max_slot` (inclusive), ordered
/// by slot.
pub fn get_balances(
    conn: &mut PgConn,
    validators: &[u64],
    min_slot: u64,
    max_slot: u64,
) -> Result<Vec<BalanceSnapshot>, Error> {
    use self::balances::dsl::*;

    let validators: Vec<i64> = validators.iter().copied().map(to_i64).collect();
    let result = balances
        .filter(slot.ge(to_i64(min_slot)))
        .filter(slot.le(to_i64(max_slot)))
        .filter(validator_index.eq_any(validators))
        .order_by((slot.asc(), validator_index.asc()))
        .select(WatchBalance::as_select())
        .load::<WatchBalance>(conn)?;

    result.into_iter().map(BalanceSnapshot::try_from).collect()
}

/// Selects every distinct slot in the `balances` table.
pub fn get_balance_slots(conn: &mut PgConn) -> Result<HashSet<u64>, Error> {
    use self::balances::dsl::*;

    let result = balances.select(slot).distinct().load::<i64>(conn)?;

    result.into_iter().map(to_u64).collect()
}

pub fn get_rocket_pool_node(
    conn: &mut PgConn,
    address: &Address,
) -> Result<Option<RocketPoolNode>, Error> {
    use self::rocket_pool_nodes::dsl::*;

    let result = rocket_pool_nodes
        .filter(node_address.eq(address_to_string(address)))
        .select(WatchRocketPoolNode::as_select())
        .first::<WatchRocketPoolNode>(conn)
        .optional()?;

    result.map(RocketPoolNode::try_from).transpose()
}

pub fn get_rocket_pool_nodes(conn: &mut PgConn) -> Result<Vec<RocketPoolNode>, Error> {
    use self::rocket_pool_nodes::dsl::*;

    let result = rocket_pool_nodes
        .select(WatchRocketPoolNode::as_select())
        .load::<WatchRocketPoolNode>(conn)?;

    result.into_iter().map(RocketPoolNode::try_from).collect()
}

/// Selects the bond reductions of `minipool`, or of every minipool if `None`.
pub fn get_bond_reductions(
    conn: &mut PgConn,
    minipool: Option<&Address>,
) -> Result<Vec<BondReduction>, Error> {
    use self::rocket_pool_bond_reductions::dsl::*;

    let mut query = rocket_pool_bond_reductions
        .select(WatchBondReduction::as_select())
        .order_by((minipool_address.asc(), reduced_at.asc()))
        .into_boxed();
    if let Some(minipool) = minipool {
        query = query.filter(minipool_address.eq(address_to_string(minipool)));
    }
    let result = query.load::<WatchBondReduction>(conn)?;

    result.into_iter().map(BondReduction::try_from).collect()
}

/// Selects every minipool along with its bond reductions.
pub fn get_minipools(conn: &mut PgConn) -> Result<Vec<Minipool>, Error> {
    use self::rocket_pool_minipools::dsl::*;

    let mut reductions: HashMap<Address, Vec<BondReduction>> = HashMap::new();
    for reduction in get_bond_reductions(conn, None)? {
        reductions
            .entry(reduction.minipool_address)
            .or_default()
            .push(reduction);
    }

    let result = rocket_pool_minipools
        .select(WatchMinipool::as_select())
        .order_by(minipool_address.asc())
        .load::<WatchMinipool>(conn)?;

    result
        .into_iter()
        .map(|row| {
            let address = models::parse_address(&row.minipool_address)?;
            row.into_minipool(reductions.remove(&address).unwrap_or_default())
        })
        .collect()
}

/// Selects the minipool running the validator `index`, along with its bond reductions.
pub fn get_minipool_by_validator_index(
    conn: &mut PgConn,
    index: u64,
) -> Result<Option<Minipool>, Error> {
    use self::rocket_pool_minipools::dsl::*;

    let result = rocket_pool_minipools
        .filter(validator_index.eq(to_i64(index)))
        .select(WatchMinipool::as_select())
        .first::<WatchMinipool>(conn)
        .optional()?;

    match result {
        Some(row) => {
            let address = models::parse_address(&row.minipool_address)?;
            let reductions = get_bond_reductions(conn, Some(&address))?;
            row.into_minipool(reductions).map(Some)
        }
        None => Ok(None),
    }
}

/// A `RewardStore` persisting to Postgres. Each call checks out its own pooled connection.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect(config: &Config) -> Result<Self, Error> {
        build_connection_pool(config).map(Self::new)
    }

    fn conn(&self) -> Result<PgConn, Error> {
        get_connection(&self.pool)
    }
}

impl RewardStore for PgStore {
    fn upsert_block_reward(&self, record: &BlockRewardRecord) -> Result<(), Error> {
        upsert_block_reward(&mut self.conn()?, record)
    }

    fn block_reward(&self, slot: u64) -> Result<Option<BlockRewardRecord>, Error> {
        get_block_reward_by_slot(&mut self.conn()?, slot)
    }

    fn block_reward_slots(&self, min_slot: u64, max_slot: u64) -> Result<HashSet<u64>, Error> {
        get_block_reward_slots(&mut self.conn()?, min_slot, max_slot)
    }

    fn block_rewards_in_range(
        &self,
        min_slot: u64,
        max_slot: u64,
        proposer_indexes: &[u64],
    ) -> Result<Vec<BlockRewardRecord>, Error> {
        get_block_rewards_in_range(&mut self.conn()?, min_slot, max_slot, proposer_indexes)
    }

    fn failed_block_rewards(&self) -> Result<Vec<BlockRewardRecord>, Error> {
        get_failed_block_rewards(&mut self.conn()?)
    }

    fn insert_withdrawals(&self, withdrawals: &[Withdrawal]) -> Result<(), Error> {
        insert_batch_withdrawals(&mut self.conn()?, withdrawals)
    }

    fn withdrawals_for_validators(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<Withdrawal>, Error> {
        get_withdrawals_for_validators(&mut self.conn()?, validator_indexes, min_slot, max_slot)
    }

    fn highest_withdrawal_slot(&self) -> Result<Option<u64>, Error> {
        get_highest_withdrawal_slot(&mut self.conn()?)
    }

    fn insert_balances(&self, balances: &[BalanceSnapshot]) -> Result<(), Error> {
        insert_batch_balances(&mut self.conn()?, balances)
    }

    fn balances(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<BalanceSnapshot>, Error> {
        get_balances(&mut self.conn()?, validator_indexes, min_slot, max_slot)
    }

    fn balance_slots(&self) -> Result<HashSet<u64>, Error> {
        get_balance_slots(&mut self.conn()?)
    }

    fn upsert_rocket_pool_node(&self, node: &RocketPoolNode) -> Result<(), Error> {
        upsert_rocket_pool_node(&mut self.conn()?, node)
    }

    fn rocket_pool_node(&self, address: Address) -> Result<Option<RocketPoolNode>, Error> {
        get_rocket_pool_node(&mut self.conn()?, &address)
    }

    fn rocket_pool_nodes(&self) -> Result<Vec<RocketPoolNode>, Error> {
        get_rocket_pool_nodes(&mut self.conn()?)
    }

    fn upsert_minipool(&self, minipool: &Minipool) -> Result<(), Error> {
        upsert_minipool(&mut self.conn()?, minipool)
    }

    fn minipools(&self) -> Result<Vec<Minipool>, Error> {
        get_minipools(&mut self.conn()?)
    }

    fn insert_bond_reduction(&self, reduction: &BondReduction) -> Result<(), Error> {
        insert_bond_reduction(&mut self.conn()?, reduction)
    }

    fn minipool_for_validator(&self, validator_index: u64) -> Result<Option<Minipool>, Error> {
        get_minipool_by_validator_index(&mut self.conn()?, validator_index)
    }
}
