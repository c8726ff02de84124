//! Gas estimation, fee suggestion and whole-balance transfer sizing

use crate::chain::{erc, ChainClient};
use crate::config::FeeConfig;
use crate::error::{TransferError, TransferResult};
use crate::types::{
    amount_from_u256, amount_to_u256, parse_hex_quantity, Amount, FeeSuggestion, TransferRequest,
    SIMPLE_TRANSFER_GAS,
};

use ethers::providers::JsonRpcClient;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Recipient, value and call data of a transfer, independent of fee fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferCall {
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
}

impl TransferCall {
    pub fn new(from: Address, transfer: &TransferRequest) -> TransferResult<Self> {
        let call = match transfer {
            TransferRequest::Native { to, amount } => Self {
                to: *to,
                value: amount_to_u256("amount", amount)?,
                data: None,
            },
            TransferRequest::Erc20 {
                contract,
                to,
                amount,
            } => Self {
                to: *contract,
                value: U256::zero(),
                data: Some(erc::erc20_transfer(*to, amount_to_u256("amount", amount)?)),
            },
            TransferRequest::Erc721 {
                contract,
                to,
                token_id,
            } => Self {
                to: *contract,
                value: U256::zero(),
                data: Some(erc::erc721_transfer_from(
                    from,
                    *to,
                    amount_to_u256("token id", token_id)?,
                )),
            },
        };
        Ok(call)
    }

    /// Fee-less request used for simulation
    pub fn simulation(&self, from: Address) -> TypedTransaction {
        let mut tx = TransactionRequest::new().from(from).to(self.to).value(self.value);
        if let Some(data) = &self.data {
            tx = tx.data(data.clone());
        }
        tx.into()
    }
}

#[derive(Deserialize)]
struct RpcReply {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Sizes transactions: gas units by simulation, fee-per-gas from market conditions
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    config: FeeConfig,
    http: reqwest::Client,
}

impl FeeEstimator {
    pub fn new(config: FeeConfig, request_timeout: Duration) -> TransferResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransferError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &FeeConfig {
        &self.config
    }

    /// Gas units the transfer would consume when sent from the bound account
    pub async fn estimate_gas<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        transfer: &TransferRequest,
    ) -> TransferResult<Amount> {
        let from = client.require_signer("estimate gas")?;
        self.estimate_gas_from(client, from.address(), transfer).await
    }

    /// Gas units the transfer would consume when sent from `from`
    pub async fn estimate_gas_from<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        from: Address,
        transfer: &TransferRequest,
    ) -> TransferResult<Amount> {
        let call = TransferCall::new(from, transfer)?;
        let operation = match transfer {
            TransferRequest::Native { .. } => "estimate native transfer gas",
            TransferRequest::Erc20 { .. } => "estimate erc20 transfer gas",
            TransferRequest::Erc721 { .. } => "estimate erc721 transfer gas",
        };

        let gas = client
            .estimate_gas(&call.simulation(from), operation)
            .await
            .map_err(|e| {
                crate::metrics::record_estimation_failure(transfer.kind());
                e
            })?;

        debug!("{} to {:?}: {} gas", operation, call.to, gas);
        Ok(amount_from_u256(gas))
    }

    /// Raw `eth_gasPrice` against an endpoint, independent of any client
    pub async fn current_gas_price(&self, rpc_url: &str) -> TransferResult<Amount> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_gasPrice",
            "params": [],
            "id": 1
        });

        let fail = |message: String| {
            crate::metrics::record_estimation_failure("gas_price");
            TransferError::estimation("eth_gasPrice", rpc_url, message)
        };

        let response = self
            .http
            .post(rpc_url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| fail(format!("malformed response: {}", e)))?;

        if let Some(error) = reply.error {
            return Err(fail(format!("node returned error {}", error)));
        }
        let raw = reply
            .result
            .ok_or_else(|| fail("response has no result".to_string()))?;

        parse_hex_quantity(&raw).ok_or_else(|| fail(format!("'{}' is not a hex quantity", raw)))
    }

    /// Fee for inclusion in the next block, sized for a simple native transfer
    pub async fn suggest_fee<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
    ) -> TransferResult<FeeSuggestion> {
        let suggestion = match client.latest_base_fee().await? {
            Some(base_fee) => {
                let tip = client.max_priority_fee().await.map(amount_from_u256);
                fee_from_market(&self.config, &amount_from_u256(base_fee), tip)?
            }
            None => {
                // No fee market: the gas price is both ceiling and tip
                let price = amount_from_u256(client.gas_price().await?);
                FeeSuggestion::new(price.clone(), price, SIMPLE_TRANSFER_GAS.into())?
            }
        };

        debug!(
            "Chain {} fee suggestion: max {} priority {}",
            client.chain_id(),
            suggestion.max_fee_per_gas,
            suggestion.max_priority_fee_per_gas
        );
        Ok(suggestion)
    }

    /// Largest native amount `from` can send once the worst-case fee is reserved
    pub async fn max_transferable_amount<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        from: Address,
    ) -> TransferResult<Amount> {
        let (amount, _fee) = self.whole_balance_transfer(client, from).await?;
        Ok(amount)
    }

    /// Balance and fee for sending everything `from` holds; the fee is the one
    /// the amount was sized against, so submit the pair together
    pub async fn whole_balance_transfer<P: JsonRpcClient>(
        &self,
        client: &ChainClient<P>,
        from: Address,
    ) -> TransferResult<(Amount, FeeSuggestion)> {
        let balance = amount_from_u256(client.get_balance(from).await?);
        let fee = self.suggest_fee(client).await?;
        let amount = max_transferable(from, &balance, &fee.gas_limit, &fee.max_fee_per_gas)?;
        Ok((amount, fee))
    }

    /// Simulated gas plus the configured headroom. A plain value transfer
    /// runs no code and costs exactly the intrinsic gas, so it gets none.
    pub fn buffered_gas_limit(&self, transfer: &TransferRequest, estimate: &Amount) -> Amount {
        if matches!(transfer, TransferRequest::Native { .. })
            && *estimate == Amount::from(SIMPLE_TRANSFER_GAS)
        {
            return estimate.clone();
        }
        with_buffer(estimate, self.config.gas_limit_buffer_percent)
    }
}

/// `maxFee = baseFee * multiplier + tip`, capped, never below the base fee
pub fn fee_from_market(
    config: &FeeConfig,
    base_fee: &Amount,
    tip: Option<Amount>,
) -> TransferResult<FeeSuggestion> {
    let mut priority = tip.unwrap_or_else(|| Amount::from(config.default_priority_fee_wei));
    let mut max_fee = base_fee * config.base_fee_multiplier + &priority;

    if let Some(cap) = config.max_fee_per_gas_wei.map(Amount::from) {
        if &cap < base_fee {
            return Err(TransferError::estimation(
                "suggest fee",
                "max_fee_per_gas_wei",
                format!("ceiling {} is below the current base fee {}", cap, base_fee),
            ));
        }
        if max_fee > cap {
            max_fee = cap;
        }
    }
    if priority > max_fee {
        priority = max_fee.clone();
    }

    FeeSuggestion::new(max_fee, priority, SIMPLE_TRANSFER_GAS.into())
}

/// `balance - gas_limit * max_fee`, failing instead of going negative
pub fn max_transferable(
    address: Address,
    balance: &Amount,
    gas_limit: &Amount,
    max_fee_per_gas: &Amount,
) -> TransferResult<Amount> {
    let fee = gas_limit * max_fee_per_gas;
    if balance < &fee {
        return Err(TransferError::InsufficientFunds {
            address,
            have: balance.clone(),
            need: fee,
        });
    }
    Ok(balance - fee)
}

/// Round-up percentage headroom
pub fn with_buffer(gas: &Amount, percent: u64) -> Amount {
    (gas * (100 + percent) + 99u32) / 100u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{MockProvider, Provider};
    use ethers::types::{Block, TxHash};
    use proptest::prelude::*;

    fn estimator() -> FeeEstimator {
        FeeEstimator::new(FeeConfig::default(), Duration::from_secs(5)).unwrap()
    }

    fn mocked() -> (ChainClient<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (
            ChainClient::new(provider, "mock://", 1337, None, Duration::from_secs(1)),
            mock,
        )
    }

    fn block_with_base_fee(base_fee: Option<u64>) -> Block<TxHash> {
        Block {
            base_fee_per_gas: base_fee.map(U256::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_max_transferable_scenario() {
        let result = max_transferable(
            Address::zero(),
            &Amount::from(1_000_000u64),
            &Amount::from(21_000u64),
            &Amount::from(20u64),
        )
        .unwrap();
        assert_eq!(result, Amount::from(580_000u64));
    }

    #[test]
    fn test_max_transferable_insufficient_funds() {
        let err = max_transferable(
            Address::zero(),
            &Amount::from(100u64),
            &Amount::from(21_000u64),
            &Amount::from(20u64),
        )
        .unwrap_err();

        assert!(err.is_insufficient_funds());
        assert!(!err.is_retryable());
        match err {
            TransferError::InsufficientFunds { have, need, .. } => {
                assert_eq!(have, Amount::from(100u64));
                assert_eq!(need, Amount::from(420_000u64));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_max_transferable_exact_fee_leaves_zero() {
        let result = max_transferable(
            Address::zero(),
            &Amount::from(420_000u64),
            &Amount::from(21_000u64),
            &Amount::from(20u64),
        )
        .unwrap();
        assert_eq!(result, Amount::from(0u64));
    }

    proptest! {
        #[test]
        fn prop_max_transferable_is_exact(
            balance in prop::collection::vec(any::<u8>(), 0..40),
            gas in 1u64..10_000_000,
            fee in prop::collection::vec(any::<u8>(), 0..34),
        ) {
            let balance = Amount::from_bytes_be(&balance);
            let gas = Amount::from(gas);
            let fee_per_gas = Amount::from_bytes_be(&fee);
            let reserved = &gas * &fee_per_gas;

            match max_transferable(Address::zero(), &balance, &gas, &fee_per_gas) {
                Ok(result) => {
                    prop_assert!(balance >= reserved);
                    prop_assert_eq!(&balance - &result, reserved);
                }
                Err(e) => {
                    prop_assert!(e.is_insufficient_funds());
                    prop_assert!(balance < reserved);
                }
            }
        }
    }

    #[test]
    fn test_fee_from_market() {
        let config = FeeConfig::default();
        let fee = fee_from_market(&config, &Amount::from(100u64), Some(Amount::from(5u64))).unwrap();

        assert_eq!(fee.max_fee_per_gas, Amount::from(205u64));
        assert_eq!(fee.max_priority_fee_per_gas, Amount::from(5u64));
        assert_eq!(fee.gas_limit, Amount::from(SIMPLE_TRANSFER_GAS));

        let fallback = fee_from_market(&config, &Amount::from(100u64), None).unwrap();
        assert_eq!(
            fallback.max_priority_fee_per_gas,
            Amount::from(config.default_priority_fee_wei)
        );
    }

    #[test]
    fn test_fee_cap_never_goes_below_base_fee() {
        let config = FeeConfig {
            max_fee_per_gas_wei: Some(150),
            ..FeeConfig::default()
        };
        let capped = fee_from_market(&config, &Amount::from(100u64), Some(Amount::from(80u64))).unwrap();
        assert_eq!(capped.max_fee_per_gas, Amount::from(150u64));
        assert_eq!(capped.max_priority_fee_per_gas, Amount::from(80u64));

        let tight = FeeConfig {
            max_fee_per_gas_wei: Some(100),
            ..FeeConfig::default()
        };
        let clamped = fee_from_market(&tight, &Amount::from(100u64), Some(Amount::from(500u64))).unwrap();
        assert_eq!(clamped.max_priority_fee_per_gas, clamped.max_fee_per_gas);

        let below = FeeConfig {
            max_fee_per_gas_wei: Some(99),
            ..FeeConfig::default()
        };
        let err = fee_from_market(&below, &Amount::from(100u64), None).unwrap_err();
        assert!(matches!(err, TransferError::Estimation { .. }));
    }

    #[test]
    fn test_buffer_rounds_up() {
        assert_eq!(with_buffer(&Amount::from(21_000u64), 20), Amount::from(25_200u64));
        assert_eq!(with_buffer(&Amount::from(7u64), 10), Amount::from(8u64));
        assert_eq!(with_buffer(&Amount::from(7u64), 0), Amount::from(7u64));
    }

    #[test]
    fn test_plain_native_transfer_gets_no_headroom() {
        let fees = estimator();
        let native = TransferRequest::Native {
            to: Address::repeat_byte(1),
            amount: Amount::from(1u64),
        };
        let erc20 = TransferRequest::Erc20 {
            contract: Address::repeat_byte(2),
            to: Address::repeat_byte(1),
            amount: Amount::from(1u64),
        };

        assert_eq!(
            fees.buffered_gas_limit(&native, &Amount::from(21_000u64)),
            Amount::from(21_000u64)
        );
        // Value sent to a contract runs its fallback, so the estimate is padded
        assert_eq!(
            fees.buffered_gas_limit(&native, &Amount::from(30_000u64)),
            Amount::from(36_000u64)
        );
        assert_eq!(
            fees.buffered_gas_limit(&erc20, &Amount::from(50_000u64)),
            Amount::from(60_000u64)
        );
    }

    #[tokio::test]
    async fn test_suggest_fee_from_base_fee_and_tip() {
        let (client, mock) = mocked();
        // Responses are served last-in first-out
        mock.push(U256::from(3u64)).unwrap();
        mock.push(block_with_base_fee(Some(50))).unwrap();

        let fee = estimator().suggest_fee(&client).await.unwrap();
        assert_eq!(fee.max_fee_per_gas, Amount::from(103u64));
        assert_eq!(fee.max_priority_fee_per_gas, Amount::from(3u64));
        assert!(fee.max_fee_per_gas >= Amount::from(50u64));
    }

    #[tokio::test]
    async fn test_suggest_fee_without_fee_market() {
        let (client, mock) = mocked();
        mock.push(U256::from(7u64)).unwrap();
        mock.push(block_with_base_fee(None)).unwrap();

        let fee = estimator().suggest_fee(&client).await.unwrap();
        assert_eq!(fee.max_fee_per_gas, Amount::from(7u64));
        assert_eq!(fee.max_priority_fee_per_gas, Amount::from(7u64));
    }

    #[tokio::test]
    async fn test_max_transferable_amount_end_to_end() {
        let (client, mock) = mocked();
        mock.push(U256::from(2u64)).unwrap();
        mock.push(block_with_base_fee(Some(9))).unwrap();
        mock.push(U256::from(1_000_000u64)).unwrap();

        let amount = estimator()
            .max_transferable_amount(&client, Address::repeat_byte(1))
            .await
            .unwrap();
        assert_eq!(amount, Amount::from(580_000u64));
    }

    #[tokio::test]
    async fn test_estimate_gas_from() {
        let (client, mock) = mocked();
        mock.push(U256::from(52_000u64)).unwrap();

        let transfer = TransferRequest::Erc20 {
            contract: Address::repeat_byte(0xcc),
            to: Address::repeat_byte(2),
            amount: Amount::from(10u64),
        };
        let gas = estimator()
            .estimate_gas_from(&client, Address::repeat_byte(1), &transfer)
            .await
            .unwrap();
        assert_eq!(gas, Amount::from(52_000u64));
    }

    #[tokio::test]
    async fn test_estimate_gas_failure_is_estimation_error() {
        let (client, _mock) = mocked();
        let transfer = TransferRequest::Native {
            to: Address::repeat_byte(2),
            amount: Amount::from(1u64),
        };
        let err = estimator()
            .estimate_gas_from(&client, Address::repeat_byte(1), &transfer)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Estimation { .. }));
    }

    #[tokio::test]
    async fn test_estimate_gas_from_bound_signer() {
        let (provider, mock) = Provider::mocked();
        let wallet: ethers::signers::LocalWallet =
            "4f3edf983ac636a65a842ce7c78d9aa706d3b113bce9c46f30d7d21715b23b1d".parse().unwrap();
        let client = ChainClient::new(provider, "mock://", 1337, Some(wallet), Duration::from_secs(1));
        mock.push(U256::from(21_000u64)).unwrap();

        let transfer = TransferRequest::Native {
            to: Address::repeat_byte(2),
            amount: Amount::from(1u64),
        };
        let gas = estimator().estimate_gas(&client, &transfer).await.unwrap();
        assert_eq!(gas, Amount::from(21_000u64));
    }

    #[tokio::test]
    async fn test_estimate_gas_needs_signer() {
        let (client, _mock) = mocked();
        let transfer = TransferRequest::Native {
            to: Address::repeat_byte(2),
            amount: Amount::from(1u64),
        };
        let err = estimator().estimate_gas(&client, &transfer).await.unwrap_err();
        assert!(matches!(err, TransferError::Unauthorized { .. }));
    }

    #[test]
    fn test_erc721_call_uses_sender_as_from() {
        let from = Address::repeat_byte(1);
        let call = TransferCall::new(
            from,
            &TransferRequest::Erc721 {
                contract: Address::repeat_byte(0xcc),
                to: Address::repeat_byte(2),
                token_id: Amount::from(9u64),
            },
        )
        .unwrap();

        assert_eq!(call.to, Address::repeat_byte(0xcc));
        assert_eq!(call.value, U256::zero());
        let data = call.data.unwrap();
        assert_eq!(&data[4 + 12..4 + 32], from.as_bytes());
    }

    #[tokio::test]
    async fn test_current_gas_price_parses_hex() {
        let _m = mockito::mock("POST", "/gas-ok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x4a817c800"}"#)
            .create();

        let url = format!("{}/gas-ok", mockito::server_url());
        let price = estimator().current_gas_price(&url).await.unwrap();
        assert_eq!(price, Amount::from(20_000_000_000u64));
    }

    #[tokio::test]
    async fn test_current_gas_price_rejects_non_hex() {
        let _m = mockito::mock("POST", "/gas-garbage")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"not-hex"}"#)
            .create();

        let url = format!("{}/gas-garbage", mockito::server_url());
        let err = estimator().current_gas_price(&url).await.unwrap_err();
        assert!(matches!(err, TransferError::Estimation { operation: "eth_gasPrice", .. }));
    }

    #[tokio::test]
    async fn test_current_gas_price_http_error() {
        let _m = mockito::mock("POST", "/gas-down")
            .with_status(503)
            .create();

        let url = format!("{}/gas-down", mockito::server_url());
        let err = estimator().current_gas_price(&url).await.unwrap_err();
        assert!(matches!(err, TransferError::Estimation { .. }));
    }

    #[tokio::test]
    async fn test_current_gas_price_node_error() {
        let _m = mockito::mock("POST", "/gas-rpc-error")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#)
            .create();

        let url = format!("{}/gas-rpc-error", mockito::server_url());
        let err = estimator().current_gas_price(&url).await.unwrap_err();
        assert!(err.to_string().contains("method not found"));
    }
}
