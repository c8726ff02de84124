//! End-to-end tests for the submission pipeline against a mocked chain

use async_trait::async_trait;
use ethers::providers::{MockProvider, Provider};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Block, TxHash, U256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use transfer_orchestrator::config::{FeeConfig, ReceiptConfig};
use transfer_orchestrator::{
    Amount, ChainClient, FeeEstimator, LeaseGuard, LocalNonceCoordinator, NonceCoordinator,
    NonceLease, NonceSource, SubmitOutcome, TransferError, TransferRequest, TransferResult,
    TransferSubmitter,
};

const KEY: &str = "4f3edf983ac636a65a842ce7c78d9aa706d3b113bce9c46f30d7d21715b23b1d";

fn signing_client() -> (ChainClient<MockProvider>, MockProvider) {
    let (provider, mock) = Provider::mocked();
    let wallet: LocalWallet = KEY.parse().unwrap();
    (
        ChainClient::new(provider, "mock://", 31337, Some(wallet), Duration::from_secs(1)),
        mock,
    )
}

fn submitter(coordinator: Arc<dyn NonceCoordinator>) -> TransferSubmitter {
    TransferSubmitter::new(
        coordinator,
        FeeEstimator::new(FeeConfig::default(), Duration::from_secs(1)).unwrap(),
        ReceiptConfig::default(),
    )
}

fn native() -> TransferRequest {
    TransferRequest::Native {
        to: Address::repeat_byte(0x42),
        amount: Amount::from(1_000u64),
    }
}

/// Queue estimate, fee and balance responses; the mock serves them last-in first-out
fn push_preparation(mock: &MockProvider) {
    mock.push(U256::from(10u64.pow(18))).unwrap();
    mock.push(U256::from(1_000_000_000u64)).unwrap();
    mock.push(Block::<TxHash> {
        base_fee_per_gas: Some(U256::from(30_000_000_000u64)),
        ..Default::default()
    })
    .unwrap();
    mock.push(U256::from(21_000u64)).unwrap();
}

/// Queue one fee-market read: base fee from the latest block, then the tip
fn push_market(mock: &MockProvider, base_fee: u64, tip: u64) {
    mock.push(U256::from(tip)).unwrap();
    mock.push(Block::<TxHash> {
        base_fee_per_gas: Some(U256::from(base_fee)),
        ..Default::default()
    })
    .unwrap();
}

/// Chain nonce source that is slow and counts how often it is asked
struct SlowSource {
    start: u64,
    calls: AtomicU64,
}

#[async_trait]
impl NonceSource for SlowSource {
    async fn next_nonce(&self, _account: Address) -> TransferResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(self.start)
    }
}

/// Coordinator that fires a cancellation token as soon as a lease is handed out
struct CancelOnLease {
    inner: LocalNonceCoordinator,
    cancel: CancellationToken,
}

#[async_trait]
impl NonceCoordinator for CancelOnLease {
    async fn lease(&self, account: Address, source: &dyn NonceSource) -> TransferResult<NonceLease> {
        let lease = self.inner.lease(account, source).await?;
        self.cancel.cancel();
        Ok(lease)
    }

    async fn commit(&self, lease: NonceLease) -> TransferResult<()> {
        self.inner.commit(lease).await
    }

    async fn release(&self, lease: NonceLease) -> TransferResult<()> {
        self.inner.release(lease).await
    }
}

#[tokio::test]
async fn sequential_transfers_use_consecutive_nonces() {
    let (client, mock) = signing_client();
    let coordinator = Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let submitter = submitter(coordinator.clone());
    let cancel = CancellationToken::new();

    // Second transfer: nonce comes from the coordinator, not the chain
    mock.push(TxHash::repeat_byte(2)).unwrap();
    push_preparation(&mock);
    // First transfer
    mock.push(TxHash::repeat_byte(1)).unwrap();
    mock.push(U256::from(40u64)).unwrap();
    push_preparation(&mock);

    let first = submitter.transfer(&client, &native(), &cancel).await.unwrap();
    let second = submitter
        .submit(&client, &native(), false, &cancel)
        .await
        .unwrap();

    assert_eq!(first, TxHash::repeat_byte(1));
    assert_eq!(
        second,
        SubmitOutcome::Submitted {
            transaction_hash: TxHash::repeat_byte(2)
        }
    );

    let from = client.address().unwrap();
    let next = coordinator.lease(from, &client).await.unwrap();
    assert_eq!(next.nonce, 42);
}

#[tokio::test]
async fn cancellation_after_lease_releases_nonce() {
    let (client, mock) = signing_client();
    let cancel = CancellationToken::new();
    let coordinator = Arc::new(CancelOnLease {
        inner: LocalNonceCoordinator::new(Duration::from_secs(30)),
        cancel: cancel.clone(),
    });
    let submitter = submitter(coordinator.clone());

    mock.push(U256::from(9u64)).unwrap();
    push_preparation(&mock);

    let err = submitter
        .submit(&client, &native(), false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled { .. }));

    let from = client.address().unwrap();
    assert_eq!(coordinator.inner.active_nonce(from).await, None);
    let retry = coordinator.inner.lease(from, &client).await.unwrap();
    assert_eq!(retry.nonce, 9);
}

#[tokio::test]
async fn concurrent_leases_are_gap_free_per_account() {
    let coordinator: Arc<dyn NonceCoordinator> =
        Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let source = Arc::new(SlowSource {
        start: 7,
        calls: AtomicU64::new(0),
    });
    let accounts = [Address::repeat_byte(0xa1), Address::repeat_byte(0xb2)];

    let mut handles = Vec::new();
    for i in 0..24u64 {
        let coordinator = coordinator.clone();
        let source = source.clone();
        let account = accounts[(i % 2) as usize];
        handles.push(tokio::spawn(async move {
            let guard = LeaseGuard::acquire(coordinator, account, source.as_ref())
                .await
                .unwrap();
            let nonce = guard.nonce();
            tokio::time::sleep(Duration::from_millis(i % 4)).await;
            guard.commit().await.unwrap();
            (account, nonce)
        }));
    }

    let mut per_account: [HashSet<u64>; 2] = Default::default();
    for handle in handles {
        let (account, nonce) = handle.await.unwrap();
        let slot = if account == accounts[0] { 0 } else { 1 };
        assert!(per_account[slot].insert(nonce), "nonce {} issued twice", nonce);
    }

    let expected: HashSet<u64> = (7..19).collect();
    assert_eq!(per_account[0], expected);
    assert_eq!(per_account[1], expected);
    // One chain read per account, the rest served from the coordinator
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn held_lease_does_not_block_other_accounts() {
    let coordinator = Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let source = SlowSource {
        start: 0,
        calls: AtomicU64::new(0),
    };

    let _held = coordinator
        .lease(Address::repeat_byte(1), &source)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    for byte in 2..10u8 {
        let lease = coordinator
            .lease(Address::repeat_byte(byte), &source)
            .await
            .unwrap();
        coordinator.commit(lease).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn max_transferable_amount_can_be_sent() {
    let (client, mock) = signing_client();
    let coordinator = Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let submitter = submitter(coordinator.clone());
    let cancel = CancellationToken::new();
    let from = client.address().unwrap();
    let balance = U256::from(1_000_000_000u64);

    // Transfer: estimate, fee, balance check, nonce, broadcast
    mock.push(TxHash::repeat_byte(7)).unwrap();
    mock.push(U256::from(5u64)).unwrap();
    mock.push(balance).unwrap();
    push_market(&mock, 10, 1);
    mock.push(U256::from(21_000u64)).unwrap();
    // Sizing: balance, then fee
    push_market(&mock, 10, 1);
    mock.push(balance).unwrap();

    let amount = submitter
        .fees()
        .max_transferable_amount(&client, from)
        .await
        .unwrap();
    // 1e9 - 21000 * (10 * 2 + 1)
    assert_eq!(amount, Amount::from(999_559_000u64));

    let transfer = TransferRequest::Native {
        to: Address::repeat_byte(0x42),
        amount,
    };
    let hash = submitter.transfer(&client, &transfer, &cancel).await.unwrap();
    assert_eq!(hash, TxHash::repeat_byte(7));

    let next = coordinator.lease(from, &client).await.unwrap();
    assert_eq!(next.nonce, 6);
}

#[tokio::test]
async fn whole_balance_transfer_uses_the_fee_it_was_sized_with() {
    let (client, mock) = signing_client();
    let coordinator = Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let submitter = submitter(coordinator.clone());
    let balance = U256::from(1_000_000_000u64);

    // Submission re-reads only the balance; no estimate, no second fee read
    mock.push(TxHash::repeat_byte(8)).unwrap();
    mock.push(U256::from(0u64)).unwrap();
    mock.push(balance).unwrap();
    push_market(&mock, 10, 1);
    mock.push(balance).unwrap();

    let hash = submitter
        .transfer_whole_balance(&client, Address::repeat_byte(0x42), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(hash, TxHash::repeat_byte(8));

    let from = client.address().unwrap();
    assert_eq!(coordinator.active_nonce(from).await, None);
    assert_eq!(coordinator.lease(from, &client).await.unwrap().nonce, 1);
}

#[tokio::test]
async fn whole_balance_transfer_below_fee_is_insufficient_funds() {
    let (client, mock) = signing_client();
    let coordinator = Arc::new(LocalNonceCoordinator::new(Duration::from_secs(30)));
    let submitter = submitter(coordinator.clone());

    push_market(&mock, 10, 1);
    mock.push(U256::from(1_000u64)).unwrap();

    let err = submitter
        .transfer_whole_balance(&client, Address::repeat_byte(0x42), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_insufficient_funds());
    assert_eq!(coordinator.active_nonce(client.address().unwrap()).await, None);
}
