use alloy::primitives::B256;
use thiserror::Error;

/// Failures while assembling the keeper configuration. All of them are fatal at init.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingEnv(&'static str),
    #[error("KEEPER_PRIVATE_KEY not set")]
    MissingKey,
    #[error("failed to parse private key: {0}")]
    InvalidKey(String),
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid vault address {0:?}")]
    InvalidAddress(String),
    #[error("VAULT_ADDRESS not set and {0} not found")]
    MissingVault(String),
    #[error("deployment descriptor {path} is unreadable: {reason}")]
    Descriptor { path: String, reason: String },
    #[error("invalid harvest schedule {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("config file {path} is unreadable: {reason}")]
    File { path: String, reason: String },
}

/// Errors surfaced by the node adapter.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc {method}: {reason}")]
    Rpc { method: &'static str, reason: String },
    #[error("decode {method}: {reason}")]
    Decode { method: &'static str, reason: String },
}

impl ChainError {
    pub fn rpc(method: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Rpc { method, reason: e.to_string() }
    }

    pub fn decode(method: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Decode { method, reason: e.to_string() }
    }
}

/// Why waiting for a receipt stopped without one.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("shutdown requested while waiting for {0}")]
    Cancelled(B256),
    #[error("{hash} not mined within {secs}s")]
    Timeout { hash: B256, secs: u64 },
    #[error("receipt query for {hash} failed")]
    Rpc {
        hash: B256,
        #[source]
        source: ChainError,
    },
}

/// Errors that stop the keeper after it has started ticking.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("chain id changed from {expected} to {observed}")]
    ChainIdMismatch { expected: u64, observed: u64 },
}
