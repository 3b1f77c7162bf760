//! The ordered strategies used to classify a block reward.
//!
//! Each strategy inspects the block and either produces a classification or skips. The first
//! strategy which does not skip decides the outcome, so the order of `Strategy::ORDER` is part of
//! the classification contract.

use super::relays::first_delivered_payload;
use super::{BlockContext, BlockRewardClassifier, BlockRewardValue, Error};
use crate::builders::PayoutStrategy;
use log::{info, warn};
use std::fmt;

/// The result of evaluating one strategy.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Matched(BlockRewardValue),
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// A relay reports having delivered the block, or the block came from a relay which can no
    /// longer be queried.
    RelayAttestation,
    /// The fee recipient is a builder which pays the proposer in the block's last transaction.
    KnownLastTxBuilder,
    /// The fee recipient pays out in the last transaction like a builder but is not registered
    /// as one.
    NewBuilderHeuristic,
    /// The extra data identifies a builder which pays the proposer's fee recipient directly or
    /// through internal transactions.
    ExtraDataBuilder,
    /// The fee recipient's adjusted balance delta is compared with the priority fees.
    BalanceVerification,
}

impl Strategy {
    pub const ORDER: [Strategy; 5] = [
        Strategy::RelayAttestation,
        Strategy::KnownLastTxBuilder,
        Strategy::NewBuilderHeuristic,
        Strategy::ExtraDataBuilder,
        Strategy::BalanceVerification,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RelayAttestation => "relay_attestation",
            Strategy::KnownLastTxBuilder => "known_last_tx_builder",
            Strategy::NewBuilderHeuristic => "new_builder_heuristic",
            Strategy::ExtraDataBuilder => "extra_data_builder",
            Strategy::BalanceVerification => "balance_verification",
        }
    }

    pub async fn evaluate(
        &self,
        classifier: &BlockRewardClassifier,
        ctx: &BlockContext,
    ) -> Result<Outcome, Error> {
        match self {
            Strategy::RelayAttestation => relay_attestation(classifier, ctx).await,
            Strategy::KnownLastTxBuilder => known_last_tx_builder(classifier, ctx).await,
            Strategy::NewBuilderHeuristic => new_builder_heuristic(classifier, ctx).await,
            Strategy::ExtraDataBuilder => extra_data_builder(classifier, ctx).await,
            Strategy::BalanceVerification => balance_verification(classifier, ctx).await,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

async fn relay_attestation(
    classifier: &BlockRewardClassifier,
    ctx: &BlockContext,
) -> Result<Outcome, Error> {
    if let Some(payload) = first_delivered_payload(classifier.relays(), ctx.block_hash).await? {
        info!("MEV found in slot {} by relay payload", ctx.slot);
        let value = classifier
            .mev_return_value(ctx, payload.proposer_fee_recipient, Some(payload.value_wei()?))
            .await?;
        return Ok(Outcome::Matched(value));
    }

    if classifier
        .registry()
        .delivered_by_unreachable_relay(ctx.slot, ctx.extra_data.as_deref())
    {
        info!(
            "Slot {} was delivered by an unreachable relay, using the fee recipient's balance",
            ctx.slot
        );
        let value = classifier
            .mev_return_value(ctx, ctx.fee_recipient, None)
            .await?;
        return Ok(Outcome::Matched(value));
    }

    Ok(Outcome::Skip)
}

async fn known_last_tx_builder(
    classifier: &BlockRewardClassifier,
    ctx: &BlockContext,
) -> Result<Outcome, Error> {
    let Some(builder) = classifier.registry().classify(&ctx.fee_recipient) else {
        return Ok(Outcome::Skip);
    };

    match builder.payout {
        PayoutStrategy::LastTx => (),
        PayoutStrategy::ContractDistributor => {
            return Err(Error::UnsupportedPayoutStrategy {
                builder: builder.name.clone(),
                payout: builder.payout,
            })
        }
        PayoutStrategy::Direct | PayoutStrategy::ContractCallInternalTxs => {
            return Ok(Outcome::Skip)
        }
    }

    let last_tx = ctx.block.last_transaction().ok_or_else(|| {
        Error::InvariantViolation(format!(
            "Block {} of builder {} has no transactions",
            ctx.block_number, builder.name
        ))
    })?;
    if last_tx.from != ctx.fee_recipient {
        return Err(Error::InvariantViolation(format!(
            "Expected payout of builder {} in the last tx of block {}, found tx from {}",
            builder.name, ctx.block_number, last_tx.from
        )));
    }

    let extra_data = ctx.extra_data.as_deref();
    if !builder.signs(extra_data) {
        return Err(Error::InvariantViolation(format!(
            "Extra data {:?} of block {} is not a signature of builder {}",
            extra_data, ctx.block_number, builder.name
        )));
    }

    let recipient = last_tx.to.ok_or_else(|| {
        Error::InvariantViolation(format!(
            "Last tx of block {} creates a contract",
            ctx.block_number
        ))
    })?;
    info!(
        "MEV found in slot {}, last tx from builder {}",
        ctx.slot, builder.name
    );
    let value = classifier
        .mev_return_value(ctx, recipient, Some(last_tx.value_wei()?))
        .await?;
    Ok(Outcome::Matched(value))
}

async fn new_builder_heuristic(
    classifier: &BlockRewardClassifier,
    ctx: &BlockContext,
) -> Result<Outcome, Error> {
    let registry = classifier.registry();
    let Some(last_tx) = ctx.block.last_transaction() else {
        return Ok(Outcome::Skip);
    };
    let from_payer = last_tx.from == ctx.fee_recipient || registry.is_mev_refunder(&last_tx.from);
    if !from_payer || registry.is_builder_fee_recipient(&ctx.fee_recipient) {
        return Ok(Outcome::Skip);
    }
    let (Some(recipient), value) = (last_tx.to, last_tx.value_wei()?) else {
        return Ok(Outcome::Skip);
    };
    if value <= 0 {
        return Ok(Outcome::Skip);
    }

    if registry.is_uncommon_extra_data(ctx.extra_data.as_deref()) {
        warn!(
            "Assuming MEV in slot {} because of the last tx from {}. Extra data {:?} suggests a \
             builder missing from the registry",
            ctx.slot, last_tx.from, ctx.extra_data
        );
    } else {
        warn!(
            "Assuming MEV in slot {} because of the last tx from {}",
            ctx.slot, last_tx.from
        );
    }

    let value = classifier
        .mev_return_value(ctx, recipient, Some(value))
        .await?;
    Ok(Outcome::Matched(value))
}

async fn extra_data_builder(
    classifier: &BlockRewardClassifier,
    ctx: &BlockContext,
) -> Result<Outcome, Error> {
    let registry = classifier.registry();
    let extra_data = ctx.extra_data.as_deref();
    let builder = registry
        .builder_for_extra_data(extra_data, PayoutStrategy::Direct)
        .or_else(|| {
            registry.builder_for_extra_data(extra_data, PayoutStrategy::ContractCallInternalTxs)
        });

    match builder {
        Some(builder) => {
            info!(
                "MEV found in slot {}, extra data of builder {}",
                ctx.slot, builder.name
            );
            let value = classifier
                .mev_return_value(ctx, ctx.fee_recipient, None)
                .await?;
            Ok(Outcome::Matched(value))
        }
        None => Ok(Outcome::Skip),
    }
}

async fn balance_verification(
    classifier: &BlockRewardClassifier,
    ctx: &BlockContext,
) -> Result<Outcome, Error> {
    let registry = classifier.registry();
    let delta = classifier.fee_recipient_delta(ctx).await?;

    if delta == ctx.priority_fees {
        info!("No MEV found in slot {}", ctx.slot);
        return Ok(Outcome::Matched(BlockRewardValue::priority_fees_only(
            ctx.priority_fees,
        )));
    }

    let transactions = ctx.block.transactions();

    let calls_mev_bot = transactions
        .iter()
        .any(|tx| tx.to.is_some_and(|to| registry.is_mev_bot_contract(&to)));
    if calls_mev_bot && delta > ctx.priority_fees {
        info!(
            "Fee recipient's balance change exceeds the priority fees and an MEV bot contract was \
             called in slot {}",
            ctx.slot
        );
        let value = classifier
            .mev_return_value(ctx, ctx.fee_recipient, Some(delta))
            .await?;
        return Ok(Outcome::Matched(value));
    }

    let paid_by_builder = transactions.iter().any(|tx| {
        tx.to == Some(ctx.fee_recipient) && registry.is_builder_fee_recipient(&tx.from)
    });
    if paid_by_builder {
        warn!(
            "Found a tx from a builder to the fee recipient in an unexpected position in slot {}",
            ctx.slot
        );
        let value = classifier
            .mev_return_value(ctx, ctx.fee_recipient, None)
            .await?;
        return Ok(Outcome::Matched(value));
    }

    Err(Error::ManualInspectionRequired(format!(
        "Fee recipient's balance change ({}) is not equal to the priority fees ({}) in slot {}",
        delta, ctx.priority_fees, ctx.slot
    )))
}
