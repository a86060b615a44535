use alloy::primitives::{B256, U256};
use tokio::sync::watch;

use crate::{
    chain::{wait_mined, ChainClient, HarvestTx, ReceiptSummary},
    config::KeeperConfig,
    error::{ChainError, KeeperError},
    guard::TickSnapshot,
    util::{wei_to_eth, wei_to_gwei},
};

/// How one harvest attempt ended.
#[derive(Debug)]
pub enum TransactionOutcome {
    /// Shutdown had already begun; nothing was sent.
    Cancelled,
    /// The signer cannot cover `gas_limit * gas_price`; nothing was sent.
    InsufficientFunds { needed: U256, available: U256 },
    /// The node refused the transaction, or the pre-flight chain id read failed.
    Rejected(ChainError),
    /// Included in a block; `success` reflects the receipt status.
    Mined(ReceiptSummary),
    /// Broadcast, but we stopped waiting before seeing a receipt. `error` wraps a [`crate::error::WaitError`].
    WaitFailed { hash: B256, error: eyre::Report },
}

impl TransactionOutcome {
    pub fn hash(&self) -> Option<B256> {
        match self {
            TransactionOutcome::Mined(r) => Some(r.hash),
            TransactionOutcome::WaitFailed { hash, .. } => Some(*hash),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransactionOutcome::Mined(r) if r.success)
    }
}

/// Sends one `harvest()` priced at the snapshot's gas price and waits for it.
///
/// There are no retries: whatever happens is reported and the next tick
/// starts over from fresh chain state. The only error returned is a chain id
/// change, which the caller must treat as fatal. Nothing is broadcast once
/// shutdown has been signalled.
pub async fn dispatch<C: ChainClient + ?Sized>(
    cfg: &KeeperConfig,
    client: &C,
    snap: &TickSnapshot,
    mut shutdown: watch::Receiver<bool>,
) -> Result<TransactionOutcome, KeeperError> {
    if *shutdown.borrow() {
        log::warn!("Shutdown in progress, not sending harvest");
        return Ok(TransactionOutcome::Cancelled);
    }

    match client.chain_id().await {
        Ok(observed) if observed != cfg.chain_id => {
            return Err(KeeperError::ChainIdMismatch { expected: cfg.chain_id, observed });
        }
        Ok(_) => {}
        Err(e) => {
            log::error!("Failed to confirm chain id before harvest: {e}");
            return Ok(TransactionOutcome::Rejected(e));
        }
    }

    let tx = HarvestTx {
        vault: cfg.vault_address,
        gas_price_wei: snap.gas_price_wei,
        gas_limit: cfg.gas_limit,
        chain_id: cfg.chain_id,
    };

    match client.account_balance(cfg.signer_address).await {
        Ok(available) if available < tx.max_fee() => {
            log::error!(
                "Keeper balance {} ETH cannot cover {} ETH for harvest",
                wei_to_eth(available),
                wei_to_eth(tx.max_fee())
            );
            return Ok(TransactionOutcome::InsufficientFunds { needed: tx.max_fee(), available });
        }
        Ok(_) => {}
        // The node will refuse an unfunded transaction anyway.
        Err(e) => log::warn!("Could not read keeper balance, sending anyway: {e}"),
    }

    if *shutdown.borrow() {
        log::warn!("Shutdown in progress, not sending harvest");
        return Ok(TransactionOutcome::Cancelled);
    }
    log::info!(
        "Sending harvest to {} at {} Gwei, gas limit {}",
        tx.vault,
        wei_to_gwei(tx.gas_price_wei),
        tx.gas_limit
    );
    let hash = match client.send_harvest(&tx).await {
        Ok(hash) => hash,
        Err(e) => {
            log::error!("Failed to send harvest transaction: {e}");
            return Ok(TransactionOutcome::Rejected(e));
        }
    };
    log::info!("Harvest transaction sent: {hash}");

    let outcome = match wait_mined(
        client,
        hash,
        cfg.receipt_poll_interval,
        cfg.receipt_timeout,
        &mut shutdown,
    )
    .await
    {
        Ok(receipt) => {
            if receipt.success {
                log::info!(
                    "Harvest successful! Gas used: {}, fee {} ETH, block {}",
                    receipt.gas_used,
                    wei_to_eth(receipt.fee()),
                    receipt.block_number.unwrap_or_default()
                );
            } else {
                log::error!(
                    "Harvest transaction {} reverted in block {}, gas used: {}",
                    receipt.hash,
                    receipt.block_number.unwrap_or_default(),
                    receipt.gas_used
                );
            }
            TransactionOutcome::Mined(receipt)
        }
        Err(e) => {
            let error = eyre::Report::new(e);
            log::error!("Failed to wait for transaction: {error}");
            for cause in error.chain().skip(1) {
                log::error!("  - {cause}");
            }
            TransactionOutcome::WaitFailed { hash, error }
        }
    };
    Ok(outcome)
}
