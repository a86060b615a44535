use std::time::Duration;

use alloy::{
    network::{EthereumWallet, ReceiptResponse, TransactionBuilder},
    primitives::{Address, B256, U256},
    providers::{
        fillers::{
            BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller
        },
        Identity, Provider, ProviderBuilder
    },
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use tokio::{sync::watch, time::Instant};

use crate::{
    abi::{harvest_calldata, IVault},
    error::{ChainError, WaitError},
};

/// Consecutive failed receipt lookups tolerated before the wait is abandoned.
const MAX_RECEIPT_FAILURES: u32 = 5;

pub type MyProvider = FillProvider<
    JoinFill<
        JoinFill<Identity,
            JoinFill<GasFiller,
                JoinFill<BlobGasFiller,
                    JoinFill<NonceFiller, ChainIdFiller>,
                >,
            >,
        >,
        WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider<
        alloy::transports::http::Http<alloy::transports::http::Client>
    >,
    alloy::transports::http::Http<alloy::transports::http::Client>,
    alloy::network::Ethereum
>;

/// A legacy-priced `harvest()` call, ready to be filled with a nonce and signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestTx {
    pub vault: Address,
    pub gas_price_wei: u128,
    pub gas_limit: u64,
    pub chain_id: u64,
}

impl HarvestTx {
    /// Worst case cost of the attempt.
    pub fn max_fee(&self) -> U256 {
        U256::from(self.gas_price_wei) * U256::from(self.gas_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub hash: B256,
    pub success: bool,
    pub gas_used: u128,
    pub effective_gas_price: u128,
    pub block_number: Option<u64>,
}

impl ReceiptSummary {
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used) * U256::from(self.effective_gas_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStats {
    pub total_supply: U256,
    pub price_per_share: U256,
}

/// Everything the keeper asks of the node.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// `lastHarvest()` of the vault, in Unix seconds.
    async fn last_harvest(&self, vault: Address) -> Result<U256, ChainError>;

    /// `balance()` of the vault, in the vault token's smallest unit.
    async fn vault_balance(&self, vault: Address) -> Result<U256, ChainError>;

    async fn vault_stats(&self, vault: Address) -> Result<VaultStats, ChainError>;

    /// The account the vault has authorized as its keeper.
    async fn vault_keeper(&self, vault: Address) -> Result<Address, ChainError>;

    async fn account_balance(&self, addr: Address) -> Result<U256, ChainError>;

    /// Signs and broadcasts, returning the transaction hash. The nonce comes
    /// from the node's pending count for the signer.
    async fn send_harvest(&self, tx: &HarvestTx) -> Result<B256, ChainError>;

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>, ChainError>;
}

/// Node adapter backed by an alloy HTTP provider. Sole owner of the RPC session and signer.
pub struct VaultClient {
    prov: MyProvider,
}

impl VaultClient {
    pub fn connect(rpc: Url, signer: PrivateKeySigner) -> Self {
        let wallet = EthereumWallet::from(signer);
        let prov = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(rpc);
        Self { prov }
    }

    fn vault(&self, addr: Address) -> IVault::IVaultInstance<
        alloy::transports::http::Http<alloy::transports::http::Client>,
        MyProvider,
    > {
        IVault::new(addr, self.prov.clone())
    }
}

fn contract_err(method: &'static str, e: alloy::contract::Error) -> ChainError {
    match e {
        alloy::contract::Error::TransportError(e) => ChainError::rpc(method, e),
        e => ChainError::decode(method, e),
    }
}

#[async_trait::async_trait]
impl ChainClient for VaultClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.prov.get_chain_id().await.map_err(|e| ChainError::rpc("eth_chainId", e))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.prov.get_gas_price().await.map_err(|e| ChainError::rpc("eth_gasPrice", e))
    }

    async fn last_harvest(&self, vault: Address) -> Result<U256, ChainError> {
        Ok(self.vault(vault).lastHarvest().call().await
            .map_err(|e| contract_err("lastHarvest()", e))?._0)
    }

    async fn vault_balance(&self, vault: Address) -> Result<U256, ChainError> {
        Ok(self.vault(vault).balance().call().await
            .map_err(|e| contract_err("balance()", e))?._0)
    }

    async fn vault_stats(&self, vault: Address) -> Result<VaultStats, ChainError> {
        let v = self.vault(vault);
        let total_supply = v.totalSupply().call().await
            .map_err(|e| contract_err("totalSupply()", e))?._0;
        let price_per_share = v.getPricePerFullShare().call().await
            .map_err(|e| contract_err("getPricePerFullShare()", e))?._0;
        Ok(VaultStats { total_supply, price_per_share })
    }

    async fn vault_keeper(&self, vault: Address) -> Result<Address, ChainError> {
        Ok(self.vault(vault).keeper().call().await
            .map_err(|e| contract_err("keeper()", e))?._0)
    }

    async fn account_balance(&self, addr: Address) -> Result<U256, ChainError> {
        self.prov.get_balance(addr).await.map_err(|e| ChainError::rpc("eth_getBalance", e))
    }

    async fn send_harvest(&self, tx: &HarvestTx) -> Result<B256, ChainError> {
        // Gas price, limit and chain id are all set, so the gas and chain id fillers stand aside
        // and only the nonce and signature are filled in.
        let req = TransactionRequest::default()
            .with_to(tx.vault)
            .with_input(harvest_calldata())
            .with_gas_price(tx.gas_price_wei)
            .with_gas_limit(tx.gas_limit)
            .with_chain_id(tx.chain_id);
        let pending = self.prov.send_transaction(req).await
            .map_err(|e| ChainError::rpc("eth_sendRawTransaction", e))?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>, ChainError> {
        let receipt = self.prov.get_transaction_receipt(hash).await
            .map_err(|e| ChainError::rpc("eth_getTransactionReceipt", e))?;
        Ok(receipt.map(|r| ReceiptSummary {
            hash: r.transaction_hash,
            success: r.status(),
            gas_used: u128::from(r.gas_used),
            effective_gas_price: u128::from(r.effective_gas_price),
            block_number: r.block_number,
        }))
    }
}

/// Polls for the receipt of `hash` until it is mined, the optional timeout
/// passes, the node keeps failing, or `shutdown` flips to true.
pub async fn wait_mined<C: ChainClient + ?Sized>(
    client: &C,
    hash: B256,
    poll: Duration,
    timeout: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ReceiptSummary, WaitError> {
    let started = Instant::now();
    let mut failures = 0;
    loop {
        if *shutdown.borrow() {
            return Err(WaitError::Cancelled(hash));
        }
        let lookup = tokio::select! {
            r = client.receipt(hash) => r,
            _ = shutdown.changed() => return Err(WaitError::Cancelled(hash)),
        };
        match lookup {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => failures = 0,
            Err(source) => {
                failures += 1;
                if failures >= MAX_RECEIPT_FAILURES {
                    return Err(WaitError::Rpc { hash, source });
                }
                log::warn!("Receipt lookup for {hash} failed ({failures}/{MAX_RECEIPT_FAILURES}): {source}");
            }
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                return Err(WaitError::Timeout { hash, secs: limit.as_secs() });
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => return Err(WaitError::Cancelled(hash)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{mock::*, *};

    const POLL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn waits_through_pending_polls() {
        let chain = MockChain::new(MockState {
            receipts: [Ok(None), Ok(None), Err(()), Ok(None)].into(),
            ..Default::default()
        });
        let (_tx, mut rx) = watch::channel(false);
        let r = wait_mined(&chain, TX_HASH, POLL, None, &mut rx).await.unwrap();
        assert!(r.success);
        assert_eq!(r.gas_used, 180_000);
        assert_eq!(*chain.receipt_calls.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn reverted_receipt_is_returned() {
        let chain = MockChain::new(MockState { final_status: Some(false), ..Default::default() });
        let (_tx, mut rx) = watch::channel(false);
        let r = wait_mined(&chain, TX_HASH, POLL, None, &mut rx).await.unwrap();
        assert!(!r.success);
    }

    #[tokio::test]
    async fn shutdown_cancels_wait() {
        let chain = MockChain::new(MockState { final_status: None, ..Default::default() });
        let (tx, mut rx) = watch::channel(false);
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(true).unwrap();
        });
        let err = wait_mined(&chain, TX_HASH, POLL, None, &mut rx).await.unwrap_err();
        assert!(matches!(err, WaitError::Cancelled(h) if h == TX_HASH));
        stop.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_and_persistent_failures() {
        let chain = MockChain::new(MockState { final_status: None, ..Default::default() });
        let (_tx, mut rx) = watch::channel(false);
        let err = wait_mined(&chain, TX_HASH, POLL, Some(Duration::from_millis(20)), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));

        let chain = MockChain::new(MockState {
            receipts: std::iter::repeat(Err(())).take(10).collect(),
            ..Default::default()
        });
        let err = wait_mined(&chain, TX_HASH, POLL, None, &mut rx).await.unwrap_err();
        assert!(matches!(err, WaitError::Rpc { .. }));
        assert_eq!(*chain.receipt_calls.lock().unwrap(), MAX_RECEIPT_FAILURES);
    }

    #[test]
    fn fees() {
        let tx = HarvestTx { vault: Address::ZERO, gas_price_wei: 50_000_000_000, gas_limit: 500_000, chain_id: 5 };
        assert_eq!(tx.max_fee(), U256::from(25_000_000_000_000_000u64));
        let r = ReceiptSummary {
            hash: B256::ZERO,
            success: true,
            gas_used: 100_000,
            effective_gas_price: 2,
            block_number: None,
        };
        assert_eq!(r.fee(), U256::from(200_000u64));
    }
}
