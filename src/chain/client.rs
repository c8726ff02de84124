//! JSON-RPC client for one chain, optionally bound to a signing account

use crate::error::{TransferError, TransferResult};

use ethers::prelude::*;
use ethers::providers::{Http, JsonRpcClient, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection to one chain's RPC endpoint.
///
/// Read-only clients carry no signer and reject every operation that needs one.
pub struct ChainClient<P = Http> {
    provider: Arc<Provider<P>>,
    endpoint: String,
    chain_id: u64,
    signer: Option<LocalWallet>,
    request_timeout: Duration,
}

impl<P> Clone for ChainClient<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            endpoint: self.endpoint.clone(),
            chain_id: self.chain_id,
            signer: self.signer.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<P> fmt::Debug for ChainClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainClient")
            .field("endpoint", &self.endpoint)
            .field("chain_id", &self.chain_id)
            .field("account", &self.signer.as_ref().map(|wallet| wallet.address()))
            .finish()
    }
}

impl<P: JsonRpcClient> ChainClient<P> {
    /// Wrap an existing provider
    pub fn new(
        provider: Provider<P>,
        endpoint: impl Into<String>,
        chain_id: u64,
        signer: Option<LocalWallet>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            endpoint: endpoint.into(),
            chain_id,
            signer: signer.map(|wallet| wallet.with_chain_id(chain_id)),
            request_timeout,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn provider(&self) -> &Provider<P> {
        &self.provider
    }

    /// Address of the bound signing account, if any
    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|wallet| wallet.address())
    }

    pub fn is_read_only(&self) -> bool {
        self.signer.is_none()
    }

    /// Bound signer, or `Unauthorized` for read-only clients
    pub fn require_signer(&self, operation: &'static str) -> TransferResult<&LocalWallet> {
        self.signer
            .as_ref()
            .ok_or(TransferError::Unauthorized { operation })
    }

    /// Run one RPC round trip under the configured request timeout
    async fn rpc<T, F>(&self, operation: &'static str, target: String, fut: F) -> TransferResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransferError::transport(operation, target, e)),
            Err(_) => Err(TransferError::transport(
                operation,
                target,
                format!("request timed out after {:?}", self.request_timeout),
            )),
        }
    }

    /// Native balance
    pub async fn get_balance(&self, address: Address) -> TransferResult<U256> {
        self.rpc(
            "get_balance",
            format!("{:?}", address),
            self.provider.get_balance(address, None),
        )
        .await
    }

    /// Read-only contract call
    pub async fn call(&self, tx: &TypedTransaction, operation: &'static str) -> TransferResult<Bytes> {
        let target = tx
            .to_addr()
            .map(|a| format!("{:?}", a))
            .unwrap_or_else(|| "contract creation".to_string());
        self.rpc(operation, target, self.provider.call(tx, None)).await
    }

    /// Simulate a transaction; every failure is an estimation failure
    pub async fn estimate_gas(
        &self,
        tx: &TypedTransaction,
        operation: &'static str,
    ) -> TransferResult<U256> {
        let target = tx
            .to_addr()
            .map(|a| format!("{:?}", a))
            .unwrap_or_else(|| "contract creation".to_string());

        match timeout(self.request_timeout, self.provider.estimate_gas(tx, None)).await {
            Ok(Ok(gas)) => Ok(gas),
            Ok(Err(e)) => Err(TransferError::estimation(operation, target, e)),
            Err(_) => Err(TransferError::estimation(
                operation,
                target,
                format!("simulation timed out after {:?}", self.request_timeout),
            )),
        }
    }

    /// Legacy gas price through the provider
    pub async fn gas_price(&self) -> TransferResult<U256> {
        self.rpc("get_gas_price", self.endpoint.clone(), self.provider.get_gas_price())
            .await
    }

    /// Base fee of the latest block; `None` on chains without a fee market
    pub async fn latest_base_fee(&self) -> TransferResult<Option<U256>> {
        let block = self
            .rpc(
                "get_latest_block",
                self.endpoint.clone(),
                self.provider.get_block(BlockNumber::Latest),
            )
            .await?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }

    /// Node's tip suggestion; `None` when the node does not support the method
    pub async fn max_priority_fee(&self) -> Option<U256> {
        let result: Result<U256, _> = self
            .rpc(
                "max_priority_fee_per_gas",
                self.endpoint.clone(),
                self.provider.request("eth_maxPriorityFeePerGas", ()),
            )
            .await;
        match result {
            Ok(fee) => Some(fee),
            Err(e) => {
                debug!("Chain {} has no priority fee suggestion: {}", self.chain_id, e);
                None
            }
        }
    }

    pub async fn block_number(&self) -> TransferResult<u64> {
        let block = self
            .rpc("get_block_number", self.endpoint.clone(), self.provider.get_block_number())
            .await?;
        Ok(block.as_u64())
    }

    pub async fn transaction_by_hash(&self, hash: H256) -> TransferResult<Option<Transaction>> {
        self.rpc(
            "get_transaction_by_hash",
            format!("{:?}", hash),
            self.provider.get_transaction(hash),
        )
        .await
    }

    pub async fn transaction_receipt(&self, hash: H256) -> TransferResult<Option<TransactionReceipt>> {
        self.rpc(
            "get_transaction_receipt",
            format!("{:?}", hash),
            self.provider.get_transaction_receipt(hash),
        )
        .await
    }

    /// Chain's next nonce for an account, counting pending transactions
    pub async fn pending_nonce(&self, address: Address) -> TransferResult<u64> {
        let count = self
            .rpc(
                "get_transaction_count",
                format!("{:?}", address),
                self.provider
                    .get_transaction_count(address, Some(BlockNumber::Pending.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    /// Sign with the bound account and RLP-encode the result
    pub async fn sign(&self, tx: &TypedTransaction) -> TransferResult<Bytes> {
        let wallet = self.require_signer("sign transaction")?;
        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TransferError::wallet("failed to sign transaction", e))?;
        Ok(tx.rlp_signed(&signature))
    }

    /// Broadcast a signed transaction and return its hash
    pub async fn send_raw(&self, raw: Bytes) -> TransferResult<H256> {
        let pending = self
            .rpc(
                "send_raw_transaction",
                self.endpoint.clone(),
                self.provider.send_raw_transaction(raw),
            )
            .await?;
        Ok(pending.tx_hash())
    }
}

/// Race a future against the caller's cancellation token
pub async fn with_cancel<T, F>(
    cancel: &CancellationToken,
    operation: &'static str,
    fut: F,
) -> TransferResult<T>
where
    F: Future<Output = TransferResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled { operation }),
        result = fut => result,
    }
}
