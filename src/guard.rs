use std::fmt;

use alloy::primitives::U256;

pub const DEFAULT_MAX_GAS_PRICE_WEI: u128 = 100_000_000_000; // 100 Gwei
pub const DEFAULT_MIN_INTERVAL_SECONDS: u64 = 3600;
pub const DEFAULT_MIN_VAULT_BALANCE: u64 = 1_000_000_000; // 1000 USDC at 6 decimals

/// Operator-defined limits a tick must clear before harvesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub max_gas_price_wei: u128,
    pub min_interval_seconds: u64,
    pub min_vault_balance: U256,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_gas_price_wei: DEFAULT_MAX_GAS_PRICE_WEI,
            min_interval_seconds: DEFAULT_MIN_INTERVAL_SECONDS,
            min_vault_balance: U256::from(DEFAULT_MIN_VAULT_BALANCE),
        }
    }
}

/// On-chain state observed at the start of a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSnapshot {
    pub now: u64,
    pub gas_price_wei: u128,
    pub last_harvest_ts: U256,
    pub vault_balance: U256,
}

impl TickSnapshot {
    /// Seconds since the last harvest, `None` when the vault reports a time ahead of ours.
    pub fn since_last_harvest(&self) -> Option<U256> {
        U256::from(self.now).checked_sub(self.last_harvest_ts)
    }
}

/// The snapshot read that failed, when a tick could not be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    GasPrice,
    LastHarvest,
    VaultBalance,
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadStage::GasPrice => "gas price",
            ReadStage::LastHarvest => "lastHarvest()",
            ReadStage::VaultBalance => "balance()",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    GasTooHigh,
    TooSoon,
    BalanceTooLow,
    Rpc(ReadStage),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::GasTooHigh => f.write_str("gas price too high"),
            SkipReason::TooSoon => f.write_str("too soon since last harvest"),
            SkipReason::BalanceTooLow => f.write_str("vault balance too low"),
            SkipReason::Rpc(stage) => write!(f, "failed to read {stage}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Execute,
    Skip(SkipReason),
}

/// Applies the gates in order: gas ceiling, minimum interval, minimum balance.
///
/// Comparisons are strict, so a value sitting exactly on a threshold passes.
pub fn evaluate(limits: &Thresholds, snap: &TickSnapshot) -> Decision {
    if snap.gas_price_wei > limits.max_gas_price_wei {
        return Decision::Skip(SkipReason::GasTooHigh);
    }
    match snap.since_last_harvest() {
        Some(elapsed) if elapsed >= U256::from(limits.min_interval_seconds) => {}
        _ => return Decision::Skip(SkipReason::TooSoon),
    }
    if snap.vault_balance < limits.min_vault_balance {
        return Decision::Skip(SkipReason::BalanceTooLow);
    }
    Decision::Execute
}
