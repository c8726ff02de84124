//! Error types for the transfer orchestrator

use ethers::types::Address;
use num_bigint::BigUint;
use thiserror::Error;

/// Boxed cause carried by wrapping variants
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for balance, fee and transfer operations
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error during {operation} for {target}: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("Gas estimation failed during {operation} for {target}: {message}")]
    Estimation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Insufficient funds for {address:?}: have {have}, need {need}")]
    InsufficientFunds {
        address: Address,
        have: BigUint,
        need: BigUint,
    },

    #[error("{operation} requires a signing account but the client is read-only")]
    Unauthorized { operation: &'static str },

    #[error("Nonce conflict for {account:?}: {message}")]
    NonceConflict { account: Address, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Cancelled during {operation}")]
    Cancelled { operation: &'static str },

    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Wallet error: {message}")]
    Wallet {
        message: String,
        #[source]
        source: BoxError,
    },
}

impl TransferError {
    /// Wrap a transport-level failure with the operation and target it hit
    pub fn transport(
        operation: &'static str,
        target: impl ToString,
        source: impl Into<BoxError>,
    ) -> Self {
        TransferError::Transport {
            operation,
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub fn estimation(operation: &'static str, target: impl ToString, message: impl ToString) -> Self {
        TransferError::Estimation {
            operation,
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn validation(field: &'static str, message: impl ToString) -> Self {
        TransferError::Validation {
            field,
            message: message.to_string(),
        }
    }

    pub fn wallet(message: impl ToString, source: impl Into<BoxError>) -> Self {
        TransferError::Wallet {
            message: message.to_string(),
            source: source.into(),
        }
    }

    /// Short label for metrics and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Config(_) => "config",
            TransferError::Transport { .. } => "transport",
            TransferError::Estimation { .. } => "estimation",
            TransferError::InsufficientFunds { .. } => "insufficient_funds",
            TransferError::Unauthorized { .. } => "unauthorized",
            TransferError::NonceConflict { .. } => "nonce_conflict",
            TransferError::Timeout { .. } => "timeout",
            TransferError::Cancelled { .. } => "cancelled",
            TransferError::Validation { .. } => "validation",
            TransferError::Wallet { .. } => "wallet",
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Transport { .. } | TransferError::Timeout { .. }
        )
    }

    /// Balance could not cover the amount plus fees; callers usually wait for funds
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, TransferError::InsufficientFunds { .. })
    }

    /// Caller supplied bad input (address, amount, token id, mnemonic)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransferError::Validation { .. } | TransferError::Wallet { .. }
        )
    }
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;
