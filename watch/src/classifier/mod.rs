//! Attributes the value of a block to priority fees and MEV.
//!
//! `BlockRewardClassifier::classify_block` builds a `BlockContext` for the slot and evaluates the
//! strategies in `Strategy::ORDER` until one of them matches. Every MEV result passes through
//! `mev_return_value`, which checks the recipient's adjusted balance change against the expected
//! payment.

pub mod relays;
pub mod strategies;

pub use strategies::{Outcome, Strategy};

use crate::builders::{BuilderRegistry, PayoutStrategy};
use crate::metrics;
use crate::reconcile::{BalanceReconciler, Distributors};
use chain_clients::{
    decode_extra_data, Address, BeaconClient, Bytes, ExecutionBlock, ExecutionClient,
    RelayClient, SlotProposerData, Wei, B256,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug)]
pub enum Error {
    Client(chain_clients::Error),
    /// The slot has no execution payload to classify.
    MissingExecutionPayload { slot: u64 },
    /// None of the known patterns explains the block. Never guessed.
    ManualInspectionRequired(String),
    /// A sanity check failed, e.g. a negative MEV value.
    InvariantViolation(String),
    UnsupportedPayoutStrategy {
        builder: String,
        payout: PayoutStrategy,
    },
}

impl Error {
    /// Label used for the classification outcome metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Error::Client(_) => "client_error",
            Error::MissingExecutionPayload { .. } => "missing_execution_payload",
            Error::ManualInspectionRequired(_) => "manual_inspection_required",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::UnsupportedPayoutStrategy { .. } => "unsupported_payout_strategy",
        }
    }
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

/// The attribution of one block's value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRewardValue {
    pub priority_fees: Wei,
    pub contains_mev: bool,
    pub mev_recipient: Option<Address>,
    pub mev_value: Option<Wei>,
}

impl BlockRewardValue {
    pub fn priority_fees_only(priority_fees: Wei) -> Self {
        Self {
            priority_fees,
            contains_mev: false,
            mev_recipient: None,
            mev_value: None,
        }
    }
}

/// A classified block together with the data stored alongside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub value: BlockRewardValue,
    pub extra_data: Bytes,
    pub strategy: Strategy,
}

/// Everything the strategies need to know about one proposed block.
pub struct BlockContext {
    pub slot: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub fee_recipient: Address,
    /// The block with full transaction objects.
    pub block: ExecutionBlock,
    pub raw_extra_data: Bytes,
    pub extra_data: Option<String>,
    pub priority_fees: Wei,
    fee_recipient_delta: OnceCell<Wei>,
}

pub struct BlockRewardClassifier {
    execution: Arc<dyn ExecutionClient>,
    relays: Vec<Arc<dyn RelayClient>>,
    registry: Arc<BuilderRegistry>,
    reconciler: BalanceReconciler,
    strategies: Vec<Strategy>,
}

impl BlockRewardClassifier {
    pub fn new(
        beacon: Arc<dyn BeaconClient>,
        execution: Arc<dyn ExecutionClient>,
        relays: Vec<Arc<dyn RelayClient>>,
        registry: Arc<BuilderRegistry>,
        distributors: Distributors,
    ) -> Self {
        let reconciler =
            BalanceReconciler::new(beacon, execution.clone(), registry.clone(), distributors);
        Self {
            execution,
            relays,
            registry,
            reconciler,
            strategies: Strategy::ORDER.to_vec(),
        }
    }

    /// Replaces the strategies evaluated by `classify_block`, in order.
    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }

    pub fn relays(&self) -> &[Arc<dyn RelayClient>] {
        &self.relays
    }

    pub fn reconciler(&self) -> &BalanceReconciler {
        &self.reconciler
    }

    pub async fn block_context(&self, data: &SlotProposerData) -> Result<BlockContext, Error> {
        let missing = || Error::MissingExecutionPayload { slot: data.slot };
        let block_number = data.block_number.ok_or_else(missing)?;
        let fee_recipient = data.fee_recipient.ok_or_else(missing)?;

        let miner_data = self.execution.get_miner_data(block_number).await?;
        if miner_data.coinbase != fee_recipient {
            return Err(Error::InvariantViolation(format!(
                "Coinbase {} of block {} differs from fee recipient {}",
                miner_data.coinbase, block_number, fee_recipient
            )));
        }
        let priority_fees = self
            .execution
            .get_block_priority_tx_fees(block_number, miner_data.tx_fee)
            .await?;
        let block = self.execution.get_block(block_number, true).await?;

        let block_hash = match data.block_hash {
            Some(hash) if hash != block.hash => {
                return Err(Error::InvariantViolation(format!(
                    "Beacon node reports block hash {} for slot {}, execution node has {}",
                    hash, data.slot, block.hash
                )))
            }
            Some(hash) => hash,
            None => block.hash,
        };

        Ok(BlockContext {
            slot: data.slot,
            block_number,
            block_hash,
            fee_recipient,
            block,
            extra_data: decode_extra_data(&miner_data.extra_data),
            raw_extra_data: miner_data.extra_data,
            priority_fees,
            fee_recipient_delta: OnceCell::new(),
        })
    }

    /// Classifies the block proposed in `data.slot`.
    pub async fn classify(&self, data: &SlotProposerData) -> Result<Classification, Error> {
        let _timer = metrics::start_timer(&metrics::BLOCK_CLASSIFICATION_TIMES);
        let result = self.classify_inner(data).await;
        let label = match &result {
            Ok(classification) => classification.strategy.name(),
            Err(e) => e.outcome_label(),
        };
        metrics::inc_counter_vec(&metrics::BLOCK_CLASSIFICATIONS, &[label]);
        result
    }

    async fn classify_inner(&self, data: &SlotProposerData) -> Result<Classification, Error> {
        let ctx = self.block_context(data).await?;
        for strategy in &self.strategies {
            match strategy.evaluate(self, &ctx).await? {
                Outcome::Matched(value) => {
                    debug!("Slot {} classified by {}", ctx.slot, strategy);
                    return Ok(Classification {
                        value,
                        extra_data: ctx.raw_extra_data.clone(),
                        strategy: *strategy,
                    });
                }
                Outcome::Skip => (),
            }
        }
        Err(Error::ManualInspectionRequired(format!(
            "No strategy matched slot {}",
            ctx.slot
        )))
    }

    pub async fn classify_block(&self, data: &SlotProposerData) -> Result<BlockRewardValue, Error> {
        self.classify(data).await.map(|classification| classification.value)
    }

    /// The fee recipient's adjusted balance delta, computed at most once per block.
    pub async fn fee_recipient_delta(&self, ctx: &BlockContext) -> Result<Wei, Error> {
        ctx.fee_recipient_delta
            .get_or_try_init(|| async {
                self.reconciler
                    .adjusted_balance_delta(
                        ctx.fee_recipient,
                        ctx.block_number,
                        ctx.slot,
                        ctx.priority_fees,
                    )
                    .await
            })
            .await
            .copied()
            .map_err(Error::from)
    }

    /// Verifies that `recipient` received an MEV payment in the block and returns it.
    ///
    /// If `expected_value` is given, the recipient's balance change must equal it, or equal it
    /// plus the priority fees when the recipient is also the fee recipient.
    pub async fn mev_return_value(
        &self,
        ctx: &BlockContext,
        recipient: Address,
        expected_value: Option<Wei>,
    ) -> Result<BlockRewardValue, Error> {
        let mut change = if recipient == ctx.fee_recipient {
            self.fee_recipient_delta(ctx).await?
        } else {
            self.reconciler
                .adjusted_balance_delta(recipient, ctx.block_number, ctx.slot, ctx.priority_fees)
                .await?
        };

        // Forwarders pass the payment on within the same block.
        if self.registry.is_forwarder(&recipient) {
            change = expected_value.ok_or_else(|| {
                Error::ManualInspectionRequired(format!(
                    "Forwarder {} received MEV in slot {} without an expected value",
                    recipient, ctx.slot
                ))
            })?;
        }

        if change < 0 {
            return Err(Error::InvariantViolation(format!(
                "Negative MEV recipient balance change {} in slot {}",
                change, ctx.slot
            )));
        }

        if let Some(expected) = expected_value {
            if change != expected && change != expected + ctx.priority_fees {
                return Err(Error::ManualInspectionRequired(format!(
                    "MEV recipient balance change {} != expected value {} in slot {}",
                    change, expected, ctx.slot
                )));
            }
        }

        if change == 0 {
            return Err(Error::ManualInspectionRequired(format!(
                "MEV recipient balance did not change in slot {}",
                ctx.slot
            )));
        }

        Ok(BlockRewardValue {
            priority_fees: ctx.priority_fees,
            contains_mev: true,
            mev_recipient: Some(recipient),
            mev_value: Some(change),
        })
    }
}
