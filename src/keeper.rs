use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    chain::ChainClient,
    config::KeeperConfig,
    dispatcher::{dispatch, TransactionOutcome},
    error::{ChainError, KeeperError},
    guard::{evaluate, Decision, ReadStage, SkipReason, TickSnapshot},
    scheduler::TickHandler,
    util::{now_sec, wei_to_eth, wei_to_gwei},
};

/// What a single tick decided and, if it acted, how the transaction went.
#[derive(Debug)]
pub struct TickReport {
    pub decision: Decision,
    pub outcome: Option<TransactionOutcome>,
}

/// Per-tick harvest logic for one vault. Holds no state between ticks.
pub struct Keeper<C> {
    cfg: Arc<KeeperConfig>,
    client: C,
}

impl<C: ChainClient> Keeper<C> {
    pub fn new(cfg: Arc<KeeperConfig>, client: C) -> Self {
        Self { cfg, client }
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn snapshot(&self) -> Result<TickSnapshot, (ReadStage, ChainError)> {
        let vault = self.cfg.vault_address;
        let gas_price_wei = self.client.gas_price().await.map_err(|e| (ReadStage::GasPrice, e))?;
        let last_harvest_ts =
            self.client.last_harvest(vault).await.map_err(|e| (ReadStage::LastHarvest, e))?;
        let vault_balance =
            self.client.vault_balance(vault).await.map_err(|e| (ReadStage::VaultBalance, e))?;
        Ok(TickSnapshot { now: now_sec(), gas_price_wei, last_harvest_ts, vault_balance })
    }

    /// One full pass: read, decide, and harvest when every gate passes.
    ///
    /// Read and send failures end the tick with a log line. Only a chain id
    /// change comes back as an error.
    pub async fn tick(&self, shutdown: watch::Receiver<bool>) -> Result<TickReport, KeeperError> {
        log::info!("Checking harvest conditions...");

        let snap = match self.snapshot().await {
            Ok(snap) => snap,
            Err((stage, e)) => {
                log::error!("Failed to get {stage}: {e}");
                return Ok(TickReport { decision: Decision::Skip(SkipReason::Rpc(stage)), outcome: None });
            }
        };

        let limits = &self.cfg.thresholds;
        let decision = evaluate(limits, &snap);
        match decision {
            Decision::Skip(SkipReason::GasTooHigh) => log::warn!(
                "Gas price too high: {} Gwei (limit {} Gwei)",
                wei_to_gwei(snap.gas_price_wei),
                wei_to_gwei(limits.max_gas_price_wei)
            ),
            Decision::Skip(SkipReason::TooSoon) => match snap.since_last_harvest() {
                Some(secs) => log::info!(
                    "Too soon to harvest. Last harvest was {secs} seconds ago (minimum {})",
                    limits.min_interval_seconds
                ),
                None => log::warn!(
                    "Too soon to harvest. Vault reports lastHarvest {} ahead of local time {}",
                    snap.last_harvest_ts,
                    snap.now
                ),
            },
            Decision::Skip(SkipReason::BalanceTooLow) => log::info!(
                "Vault balance too low: {} (minimum {})",
                snap.vault_balance,
                limits.min_vault_balance
            ),
            Decision::Skip(SkipReason::Rpc(_)) => {}
            Decision::Execute => log::info!("Conditions met, executing harvest..."),
        }

        let outcome = match decision {
            Decision::Execute => Some(dispatch(&self.cfg, &self.client, &snap, shutdown).await?),
            Decision::Skip(_) => None,
        };
        if let Some(out) = &outcome {
            log::debug!(
                "Harvest attempt finished, success: {}, tx: {:?}",
                out.is_success(),
                out.hash()
            );
        }
        Ok(TickReport { decision, outcome })
    }

    /// Operator-facing summary logged once before the first tick. Nothing here is fatal.
    pub async fn report_startup(&self) {
        let cfg = &self.cfg;
        log::info!("Starting Keeper service...");
        log::info!("Vault address: {}", cfg.vault_address);
        log::info!("Keeper address: {}", cfg.signer_address);
        log::info!(
            "Chain id: {} via {}",
            cfg.chain_id,
            cfg.rpc_endpoint.host_str().unwrap_or("rpc endpoint")
        );

        match self.client.account_balance(cfg.signer_address).await {
            Ok(bal) => log::info!("ETH balance: {}", wei_to_eth(bal)),
            Err(e) => log::warn!("Could not read keeper balance: {e}"),
        }

        match self.client.vault_stats(cfg.vault_address).await {
            Ok(stats) => log::info!(
                "Vault total supply {}, price per full share {}",
                stats.total_supply,
                stats.price_per_share
            ),
            Err(e) => log::debug!("Vault stats unavailable: {e}"),
        }

        match self.client.vault_keeper(cfg.vault_address).await {
            Ok(keeper) if keeper == cfg.signer_address => {
                log::info!("Keeper address is authorized on the vault");
            }
            Ok(keeper) => log::warn!(
                "Vault keeper is {keeper}, not {}; harvest may revert",
                cfg.signer_address
            ),
            Err(e) => log::warn!("Could not check keeper authorization: {e}"),
        }
    }
}

#[async_trait::async_trait]
impl<C: ChainClient + 'static> TickHandler for Keeper<C> {
    async fn on_tick(&self, shutdown: watch::Receiver<bool>) -> Result<(), KeeperError> {
        self.tick(shutdown).await.map(|_| ())
    }
}
