use crate::aggregation::{self, RewardsRequest, ValidatorRewards};
use crate::metrics;
use crate::server::{Context, Error};
use crate::types::BlockRewardRecord;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Slots whose block reward could not be classified, for one proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingData {
    pub validator_index: Option<u64>,
    pub slots: Vec<u64>,
}

pub async fn get_block_reward(
    State(ctx): State<Arc<Context>>,
    Path(slot): Path<u64>,
) -> Result<Json<BlockRewardRecord>, Error> {
    match ctx.store.block_reward(slot)? {
        Some(record) => Ok(Json(record)),
        None => Err(Error::NotFound),
    }
}

pub async fn get_missing_data(
    State(ctx): State<Arc<Context>>,
) -> Result<Json<Vec<MissingData>>, Error> {
    let missing = aggregation::missing_block_rewards(ctx.store.as_ref())?;
    Ok(Json(
        missing
            .into_iter()
            .map(|(validator_index, slots)| MissingData {
                validator_index,
                slots,
            })
            .collect(),
    ))
}

pub async fn post_rewards(
    State(ctx): State<Arc<Context>>,
    Json(request): Json<RewardsRequest>,
) -> Result<Json<Vec<ValidatorRewards>>, Error> {
    if request.validator_indexes.is_empty() {
        return Err(Error::BadRequest("no validator indexes given".to_string()));
    }
    let today = Utc::now().date_naive();
    let rewards = ctx.aggregator.validator_rewards(&request, today).await?;
    Ok(Json(rewards))
}

pub async fn get_metrics() -> Result<String, Error> {
    metrics::encode_text().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        Error::Other(e)
    })
}
