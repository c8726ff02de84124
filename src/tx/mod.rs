//! Transfer pipeline: fee estimation, nonce leasing and submission

mod gas;
mod nonce;
mod sender;

pub use gas::{fee_from_market, max_transferable, with_buffer, FeeEstimator};
pub use nonce::{LeaseGuard, LocalNonceCoordinator, NonceCoordinator, NonceLease, NonceSource};
pub use sender::{PreparedTransfer, TransferSubmitter};
