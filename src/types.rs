//! Value types shared by the fee estimator, submitter and API

use crate::error::{TransferError, TransferResult};

use ethers::types::{Address, TransactionReceipt, H256, U256};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::Serialize;
use std::str::FromStr;

/// Non-negative amount in the chain's smallest unit (wei or token base units)
pub type Amount = BigUint;

/// Gas consumed by a plain native transfer
pub const SIMPLE_TRANSFER_GAS: u64 = 21_000;

/// Widen a 256-bit chain quantity to an unbounded amount
pub fn amount_from_u256(value: U256) -> Amount {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

/// Narrow an amount back to the chain's 256-bit word, rejecting overflow
pub fn amount_to_u256(field: &'static str, value: &Amount) -> TransferResult<U256> {
    if value.bits() > 256 {
        return Err(TransferError::validation(
            field,
            format!("{} does not fit in 256 bits", value),
        ));
    }
    Ok(U256::from_big_endian(&value.to_bytes_be()))
}

/// Parse a decimal amount string
pub fn parse_amount(field: &'static str, input: &str) -> TransferResult<Amount> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferError::validation(
            field,
            format!("'{}' is not a non-negative decimal integer", input),
        ));
    }
    BigUint::from_str(trimmed).map_err(|e| TransferError::validation(field, e))
}

/// Parse a 0x-prefixed hexadecimal quantity as returned by JSON-RPC
pub fn parse_hex_quantity(input: &str) -> Option<Amount> {
    let digits = input.trim().strip_prefix("0x").or_else(|| input.trim().strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

/// Parse a 20-byte hex address
pub fn parse_address(field: &'static str, input: &str) -> TransferResult<Address> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.len() != 40 {
        return Err(TransferError::validation(
            field,
            format!("'{}' is not a 20-byte hex address", input),
        ));
    }
    Address::from_str(trimmed).map_err(|e| TransferError::validation(field, e))
}

/// Parse a 32-byte transaction hash
pub fn parse_tx_hash(input: &str) -> TransferResult<H256> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.len() != 64 {
        return Err(TransferError::validation(
            "transaction hash",
            format!("'{}' is not a 32-byte hex hash", input),
        ));
    }
    H256::from_str(trimmed).map_err(|e| TransferError::validation("transaction hash", e))
}

/// A transfer the caller wants to make from the client's bound account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    Native {
        to: Address,
        amount: Amount,
    },
    Erc20 {
        contract: Address,
        to: Address,
        amount: Amount,
    },
    Erc721 {
        contract: Address,
        to: Address,
        token_id: Amount,
    },
}

impl TransferRequest {
    pub fn recipient(&self) -> Address {
        match self {
            TransferRequest::Native { to, .. }
            | TransferRequest::Erc20 { to, .. }
            | TransferRequest::Erc721 { to, .. } => *to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransferRequest::Native { .. } => "native",
            TransferRequest::Erc20 { .. } => "erc20",
            TransferRequest::Erc721 { .. } => "erc721",
        }
    }

    /// Address the transaction is sent to: the recipient or the token contract
    pub fn target(&self) -> Address {
        match self {
            TransferRequest::Native { to, .. } => *to,
            TransferRequest::Erc20 { contract, .. } | TransferRequest::Erc721 { contract, .. } => {
                *contract
            }
        }
    }
}

/// Fee parameters for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeSuggestion {
    #[serde(serialize_with = "serialize_decimal")]
    pub max_fee_per_gas: Amount,
    #[serde(serialize_with = "serialize_decimal")]
    pub max_priority_fee_per_gas: Amount,
    #[serde(serialize_with = "serialize_decimal")]
    pub gas_limit: Amount,
}

impl FeeSuggestion {
    /// Build a suggestion, enforcing `max_fee >= priority_fee` and `gas_limit > 0`
    pub fn new(
        max_fee_per_gas: Amount,
        max_priority_fee_per_gas: Amount,
        gas_limit: Amount,
    ) -> TransferResult<Self> {
        if max_priority_fee_per_gas > max_fee_per_gas {
            return Err(TransferError::validation(
                "fee",
                format!(
                    "priority fee {} exceeds max fee {}",
                    max_priority_fee_per_gas, max_fee_per_gas
                ),
            ));
        }
        if gas_limit.is_zero() {
            return Err(TransferError::validation("gas limit", "must be positive"));
        }
        Ok(Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
            gas_limit,
        })
    }

    pub fn with_gas_limit(self, gas_limit: Amount) -> TransferResult<Self> {
        Self::new(self.max_fee_per_gas, self.max_priority_fee_per_gas, gas_limit)
    }

    /// Worst-case fee: every unit of gas at the max fee
    pub fn max_cost(&self) -> Amount {
        &self.gas_limit * &self.max_fee_per_gas
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// A mined transaction's outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub status: ReceiptStatus,
}

impl TryFrom<TransactionReceipt> for TransferReceipt {
    type Error = TransferError;

    fn try_from(receipt: TransactionReceipt) -> TransferResult<Self> {
        let block_number = receipt.block_number.ok_or_else(|| {
            TransferError::validation(
                "receipt",
                format!("{:?} has no block number", receipt.transaction_hash),
            )
        })?;
        let status = match receipt.status {
            Some(status) if status.as_u64() == 1 => ReceiptStatus::Success,
            _ => ReceiptStatus::Failure,
        };
        Ok(Self {
            transaction_hash: receipt.transaction_hash,
            block_number: block_number.as_u64(),
            status,
        })
    }
}

/// What `submit` hands back: the hash, or the receipt when asked to wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Submitted { transaction_hash: H256 },
    Mined(TransferReceipt),
}

impl SubmitOutcome {
    pub fn transaction_hash(&self) -> H256 {
        match self {
            SubmitOutcome::Submitted { transaction_hash } => *transaction_hash,
            SubmitOutcome::Mined(receipt) => receipt.transaction_hash,
        }
    }
}

pub(crate) fn serialize_decimal<S: serde::Serializer>(
    value: &Amount,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}
