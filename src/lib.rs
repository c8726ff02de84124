//! Transfer Orchestrator - fee-aware, nonce-safe transfers on EVM JSON-RPC chains
//!
//! Given a chain client bound to an account, the crate reads balances, sizes
//! and prices transfers, computes how much of a balance can be sent once
//! fees are reserved, and submits native, ERC20 and ERC721 transfers with
//! per-account nonce leasing.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tx;
pub mod types;
pub mod wallet;

pub use chain::{ChainClient, ChainRegistry, ClientFactory};
pub use error::{TransferError, TransferResult};
pub use tx::{
    FeeEstimator, LeaseGuard, LocalNonceCoordinator, NonceCoordinator, NonceLease, NonceSource,
    TransferSubmitter,
};
pub use types::{Amount, FeeSuggestion, SubmitOutcome, TransferReceipt, TransferRequest};
pub use wallet::{Account, HdWallet, WordCount};
