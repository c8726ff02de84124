//! Nonce leasing for reliable transaction submission
//!
//! Handles:
//! - Per-account serialization of nonce issuance
//! - Commit on broadcast, release on local failure
//! - Reclaiming leases abandoned by crashed callers

use crate::error::{TransferError, TransferResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Authoritative "next nonce" for an account, as reported by the chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn next_nonce(&self, account: Address) -> TransferResult<u64>;
}

#[async_trait]
impl<P: ethers::providers::JsonRpcClient> NonceSource for crate::chain::ChainClient<P> {
    async fn next_nonce(&self, account: Address) -> TransferResult<u64> {
        self.pending_nonce(account).await
    }
}

/// A reserved nonce awaiting commit or release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceLease {
    pub account: Address,
    pub nonce: u64,
    token: Uuid,
}

impl NonceLease {
    pub fn new(account: Address, nonce: u64) -> Self {
        Self {
            account,
            nonce,
            token: Uuid::new_v4(),
        }
    }

    /// Opaque token identifying this lease to the coordinator
    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// Hands out nonces so concurrent submitters for one account never collide.
///
/// Every lease must be resolved exactly once with `commit` or `release`.
#[async_trait]
pub trait NonceCoordinator: Send + Sync {
    /// Wait until no other lease is active for `account`, then reserve its next nonce
    async fn lease(&self, account: Address, source: &dyn NonceSource) -> TransferResult<NonceLease>;

    /// The nonce was consumed by a broadcast transaction
    async fn commit(&self, lease: NonceLease) -> TransferResult<()>;

    /// The nonce was never broadcast; hand it out again
    async fn release(&self, lease: NonceLease) -> TransferResult<()>;

    /// Forget cached state so the next lease re-reads the chain
    async fn resync(&self, _account: Address) -> TransferResult<()> {
        Ok(())
    }
}

/// Scoped lease: releases on drop unless explicitly committed or released
pub struct LeaseGuard {
    coordinator: Arc<dyn NonceCoordinator>,
    lease: Option<NonceLease>,
}

impl LeaseGuard {
    pub async fn acquire(
        coordinator: Arc<dyn NonceCoordinator>,
        account: Address,
        source: &dyn NonceSource,
    ) -> TransferResult<Self> {
        let lease = coordinator.lease(account, source).await?;
        Ok(Self {
            coordinator,
            lease: Some(lease),
        })
    }

    pub fn nonce(&self) -> u64 {
        self.lease.as_ref().map(|l| l.nonce).unwrap_or_default()
    }

    pub async fn commit(mut self) -> TransferResult<()> {
        match self.lease.take() {
            Some(lease) => self.coordinator.commit(lease).await,
            None => Ok(()),
        }
    }

    pub async fn release(mut self) -> TransferResult<()> {
        match self.lease.take() {
            Some(lease) => self.coordinator.release(lease).await,
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        warn!(
            "Lease for nonce {} of {:?} dropped unresolved, releasing",
            lease.nonce, lease.account
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    if let Err(e) = coordinator.release(lease).await {
                        warn!("Failed to release dropped lease: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release lease; coordinator timeout will reclaim it"),
        }
    }
}

/// Per-account nonce state
#[derive(Default)]
struct AccountNonceState {
    /// Next nonce to hand out; `None` until read from the chain
    next: Option<u64>,
    /// Outstanding lease: token, nonce, reclaim deadline
    active: Option<(Uuid, u64, Instant)>,
}

impl AccountNonceState {
    fn holds(&self, lease: &NonceLease) -> bool {
        matches!(self.active, Some((token, _, _)) if token == lease.token)
    }
}

struct AccountSlot {
    state: Mutex<AccountNonceState>,
    released: Notify,
}

/// In-process coordinator: one slot per account, leases expire after `lease_timeout`
pub struct LocalNonceCoordinator {
    accounts: DashMap<Address, Arc<AccountSlot>>,
    lease_timeout: Duration,
}

impl LocalNonceCoordinator {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            lease_timeout,
        }
    }

    fn slot(&self, account: Address) -> Arc<AccountSlot> {
        self.accounts
            .entry(account)
            .or_insert_with(|| {
                Arc::new(AccountSlot {
                    state: Mutex::new(AccountNonceState::default()),
                    released: Notify::new(),
                })
            })
            .clone()
    }

    /// Lease currently outstanding for an account
    pub async fn active_nonce(&self, account: Address) -> Option<u64> {
        let slot = self.accounts.get(&account)?.clone();
        let state = slot.state.lock().await;
        state.active.map(|(_, nonce, _)| nonce)
    }

    fn conflict(lease: &NonceLease, message: &str) -> TransferError {
        TransferError::NonceConflict {
            account: lease.account,
            message: format!("nonce {}: {}", lease.nonce, message),
        }
    }
}

#[async_trait]
impl NonceCoordinator for LocalNonceCoordinator {
    async fn lease(&self, account: Address, source: &dyn NonceSource) -> TransferResult<NonceLease> {
        let slot = self.slot(account);
        let started = Instant::now();

        loop {
            // Created before the lock so a release between unlock and wait is not missed
            let notified = slot.released.notified();
            let mut state = slot.state.lock().await;

            match state.active.clone() {
                Some((_, _, expires)) if Instant::now() < expires => {
                    drop(state);
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(expires) => {}
                    }
                    continue;
                }
                Some((_, nonce, _)) => {
                    warn!(
                        "Reclaiming expired lease for nonce {} of {:?}",
                        nonce, account
                    );
                    crate::metrics::record_lease_reclaimed();
                    state.active = None;
                    // The abandoned caller may have broadcast; trust the chain
                    state.next = None;
                }
                None => {}
            }

            let nonce = match state.next {
                Some(nonce) => nonce,
                None => {
                    let nonce = source.next_nonce(account).await?;
                    state.next = Some(nonce);
                    nonce
                }
            };

            let lease = NonceLease::new(account, nonce);
            state.active = Some((lease.token, nonce, Instant::now() + self.lease_timeout));
            crate::metrics::record_lease_acquired(started.elapsed().as_secs_f64());
            debug!("Leased nonce {} for {:?}", nonce, account);
            return Ok(lease);
        }
    }

    async fn commit(&self, lease: NonceLease) -> TransferResult<()> {
        let slot = self.slot(lease.account);
        {
            let mut state = slot.state.lock().await;
            if !state.holds(&lease) {
                return Err(Self::conflict(&lease, "lease expired or was reclaimed before commit"));
            }
            state.active = None;
            state.next = Some(lease.nonce + 1);
        }
        slot.released.notify_waiters();
        crate::metrics::record_lease_committed();
        debug!("Committed nonce {} for {:?}", lease.nonce, lease.account);
        Ok(())
    }

    async fn release(&self, lease: NonceLease) -> TransferResult<()> {
        let slot = self.slot(lease.account);
        {
            let mut state = slot.state.lock().await;
            if !state.holds(&lease) {
                return Err(Self::conflict(&lease, "lease expired or was reclaimed before release"));
            }
            state.active = None;
        }
        slot.released.notify_waiters();
        crate::metrics::record_lease_released();
        debug!("Released nonce {} for {:?}", lease.nonce, lease.account);
        Ok(())
    }

    async fn resync(&self, account: Address) -> TransferResult<()> {
        let slot = self.slot(account);
        let mut state = slot.state.lock().await;
        state.next = None;
        debug!("Dropped cached nonce for {:?}", account);
        Ok(())
    }
}
