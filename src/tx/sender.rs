//! Transfer submission: size, lease a nonce, sign, broadcast, optionally await the receipt

use super::gas::{FeeEstimator, TransferCall};
use super::nonce::{LeaseGuard, NonceCoordinator};
use crate::chain::{with_cancel, ChainClient};
use crate::config::{ReceiptConfig, TxType};
use crate::error::{TransferError, TransferResult};
use crate::types::{
    amount_from_u256, amount_to_u256, Amount, FeeSuggestion, SubmitOutcome, TransferReceipt,
    TransferRequest,
};

use ethers::prelude::*;
use ethers::providers::JsonRpcClient;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A transfer sized and priced, waiting for a nonce
#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub from: Address,
    call: TransferCall,
    pub fee: FeeSuggestion,
}

/// Assembles, signs and broadcasts transfers from a client's bound account
pub struct TransferSubmitter {
    coordinator: Arc<dyn NonceCoordinator>,
    fees: FeeEstimator,
    receipts: ReceiptConfig,
}

impl TransferSubmitter {
    pub fn new(
        coordinator: Arc<dyn NonceCoordinator>,
        fees: FeeEstimator,
        receipts: ReceiptConfig,
    ) -> Self {
        Self {
            coordinator,
            fees,
            receipts,
        }
    }

    pub fn fees(&self) -> &FeeEstimator {
        &self.fees
    }

    pub fn coordinator(&self) -> &Arc<dyn NonceCoordinator> {
        &self.coordinator
    }

    /// Send a transfer and return its hash once broadcast
    pub async fn transfer<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        cancel: &CancellationToken,
    ) -> TransferResult<H256> {
        let outcome = self.submit(client, transfer, false, cancel).await?;
        Ok(outcome.transaction_hash())
    }

    /// Send a transfer and wait until it is mined
    pub async fn transfer_and_wait_for_receipt<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        cancel: &CancellationToken,
    ) -> TransferResult<TransferReceipt> {
        match self.submit(client, transfer, true, cancel).await? {
            SubmitOutcome::Mined(receipt) => Ok(receipt),
            SubmitOutcome::Submitted { transaction_hash } => {
                self.wait_for_receipt(client, transaction_hash, cancel).await
            }
        }
    }

    /// Send everything the bound account holds to `to`, less the reserved fee
    pub async fn transfer_whole_balance<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        to: Address,
        cancel: &CancellationToken,
    ) -> TransferResult<H256> {
        let from = client.require_signer("transfer whole balance")?.address();
        let (amount, fee) = with_cancel(
            cancel,
            "size whole balance",
            self.fees.whole_balance_transfer(client, from),
        )
        .await?;

        let transfer = TransferRequest::Native { to, amount };
        let outcome = self
            .submit_with_fee(client, &transfer, Some(fee), false, cancel)
            .await?;
        Ok(outcome.transaction_hash())
    }

    /// Full pipeline. The nonce lease is committed only after a successful
    /// broadcast and released on every other exit path.
    pub async fn submit<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        wait_for_receipt: bool,
        cancel: &CancellationToken,
    ) -> TransferResult<SubmitOutcome> {
        self.submit_with_fee(client, transfer, None, wait_for_receipt, cancel)
            .await
    }

    /// Like [`submit`](Self::submit), but a supplied fee (gas limit included)
    /// is used as-is instead of estimating and pricing the transfer
    pub async fn submit_with_fee<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        fee: Option<FeeSuggestion>,
        wait_for_receipt: bool,
        cancel: &CancellationToken,
    ) -> TransferResult<SubmitOutcome> {
        let result = self
            .submit_inner(client, transfer, fee, wait_for_receipt, cancel)
            .await;
        if let Err(e) = &result {
            crate::metrics::record_transfer_failed(client.chain_id(), transfer.kind(), e.kind());
        }
        result
    }

    async fn submit_inner<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        fee: Option<FeeSuggestion>,
        wait_for_receipt: bool,
        cancel: &CancellationToken,
    ) -> TransferResult<SubmitOutcome> {
        client.require_signer("submit transfer")?;

        // Size and price before reserving a nonce so estimation failures never hold the account
        let prepared = self.prepare(client, transfer, fee, cancel).await?;

        let guard = with_cancel(
            cancel,
            "lease nonce",
            LeaseGuard::acquire(self.coordinator.clone(), prepared.from, client),
        )
        .await?;
        let nonce = guard.nonce();

        let tx = match self.build_transaction(client.chain_id(), &prepared, nonce) {
            Ok(tx) => tx,
            Err(e) => return Err(abandon(guard, e).await),
        };

        let raw = match client.sign(&tx).await {
            Ok(raw) => raw,
            Err(e) => return Err(abandon(guard, e).await),
        };

        let hash = match with_cancel(cancel, "broadcast", client.send_raw(raw)).await {
            Ok(hash) => hash,
            Err(e) if is_nonce_too_low(&e) => {
                warn!(
                    "Nonce {} for {:?} already used on chain {}, resyncing",
                    nonce,
                    prepared.from,
                    client.chain_id()
                );
                let e = abandon(guard, e).await;
                self.coordinator.resync(prepared.from).await?;
                return Err(TransferError::NonceConflict {
                    account: prepared.from,
                    message: format!("nonce {} rejected by chain: {}", nonce, e),
                });
            }
            Err(e) => {
                error!("Broadcast of nonce {} failed: {}", nonce, e);
                return Err(abandon(guard, e).await);
            }
        };

        if let Err(e) = guard.commit().await {
            // Already on the wire; the coordinator re-reads the chain after a reclaim
            warn!("Transaction {:?} broadcast but lease commit failed: {}", hash, e);
        }

        crate::metrics::record_transfer_submitted(client.chain_id(), transfer.kind());
        info!(
            "Submitted {} transfer {:?} from {:?} with nonce {} on chain {}",
            transfer.kind(),
            hash,
            prepared.from,
            nonce,
            client.chain_id()
        );

        if !wait_for_receipt {
            return Ok(SubmitOutcome::Submitted {
                transaction_hash: hash,
            });
        }

        let receipt = self.wait_for_receipt(client, hash, cancel).await?;
        Ok(SubmitOutcome::Mined(receipt))
    }

    /// Estimate gas, add headroom and attach the suggested fee, unless the
    /// caller already supplied one
    pub async fn prepare<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
        fee: Option<FeeSuggestion>,
        cancel: &CancellationToken,
    ) -> TransferResult<PreparedTransfer> {
        let from = client.require_signer("prepare transfer")?.address();
        let call = TransferCall::new(from, transfer)?;

        let fee = match fee {
            Some(fee) => fee,
            None => {
                let estimate = with_cancel(
                    cancel,
                    "estimate gas",
                    self.fees.estimate_gas_from(client, from, transfer),
                )
                .await?;
                let gas_limit = self.fees.buffered_gas_limit(transfer, &estimate);

                with_cancel(cancel, "suggest fee", self.fees.suggest_fee(client))
                    .await?
                    .with_gas_limit(gas_limit)?
            }
        };

        if let TransferRequest::Native { amount, .. } = transfer {
            let balance = amount_from_u256(
                with_cancel(cancel, "get balance", client.get_balance(from)).await?,
            );
            let need: Amount = amount + fee.max_cost();
            if balance < need {
                return Err(TransferError::InsufficientFunds {
                    address: from,
                    have: balance,
                    need,
                });
            }
        }

        debug!(
            "Prepared {} transfer from {:?}: gas {}, max fee {}",
            transfer.kind(),
            from,
            fee.gas_limit,
            fee.max_fee_per_gas
        );
        Ok(PreparedTransfer { from, call, fee })
    }

    /// Wire transaction for a prepared transfer at `nonce`
    pub fn build_transaction(
        &self,
        chain_id: u64,
        prepared: &PreparedTransfer,
        nonce: u64,
    ) -> TransferResult<TypedTransaction> {
        let call = &prepared.call;
        let gas = amount_to_u256("gas limit", &prepared.fee.gas_limit)?;
        let max_fee = amount_to_u256("max fee per gas", &prepared.fee.max_fee_per_gas)?;

        let tx = match self.fees.config().tx_type {
            TxType::Legacy => {
                let mut tx = TransactionRequest::new()
                    .from(prepared.from)
                    .to(call.to)
                    .value(call.value)
                    .nonce(nonce)
                    .gas(gas)
                    .gas_price(max_fee)
                    .chain_id(chain_id);
                if let Some(data) = &call.data {
                    tx = tx.data(data.clone());
                }
                TypedTransaction::Legacy(tx)
            }
            TxType::Eip1559 => {
                let priority = amount_to_u256(
                    "max priority fee per gas",
                    &prepared.fee.max_priority_fee_per_gas,
                )?;
                let mut tx = Eip1559TransactionRequest::new()
                    .from(prepared.from)
                    .to(call.to)
                    .value(call.value)
                    .nonce(nonce)
                    .gas(gas)
                    .max_fee_per_gas(max_fee)
                    .max_priority_fee_per_gas(priority)
                    .chain_id(chain_id);
                if let Some(data) = &call.data {
                    tx = tx.data(data.clone());
                }
                TypedTransaction::Eip1559(tx)
            }
        };
        Ok(tx)
    }

    /// Poll for a receipt until it is mined, the deadline passes or the caller cancels
    pub async fn wait_for_receipt<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        hash: H256,
        cancel: &CancellationToken,
    ) -> TransferResult<TransferReceipt> {
        let started = Instant::now();
        let deadline = started + self.receipts.timeout();

        loop {
            match with_cancel(cancel, "wait for receipt", client.transaction_receipt(hash)).await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => {
                    crate::metrics::record_receipt_latency(
                        client.chain_id(),
                        started.elapsed().as_secs_f64(),
                    );
                    let receipt = TransferReceipt::try_from(receipt)?;
                    info!(
                        "Transaction {:?} mined in block {} ({:?})",
                        hash, receipt.block_number, receipt.status
                    );
                    return Ok(receipt);
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Receipt poll for {:?} failed, retrying: {}", hash, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("No receipt for {:?} after {:?}", hash, self.receipts.timeout());
                return Err(TransferError::Timeout {
                    operation: format!("receipt of {:?}", hash),
                });
            }

            let pause = self.receipts.poll_interval().min(deadline - now);
            with_cancel(cancel, "wait for receipt", async {
                tokio::time::sleep(pause).await;
                Ok(())
            })
            .await?;
        }
    }
}

/// Release the lease, keeping the original error
async fn abandon(guard: LeaseGuard, error: TransferError) -> TransferError {
    if let Err(e) = guard.release().await {
        warn!("Failed to release nonce lease after error: {}", e);
    }
    error
}

fn is_nonce_too_low(error: &TransferError) -> bool {
    matches!(error, TransferError::Transport { .. })
        && error.to_string().to_lowercase().contains("nonce too low")
}
