//! Chain module - client construction and read pass-throughs
//!
//! This module provides:
//! - Read-only and signing clients for one JSON-RPC endpoint
//! - Native, ERC20 and ERC721 balance reads
//! - Block and transaction lookups
//! - A registry of the clients configured for the service

mod client;
pub mod erc;

pub use client::{with_cancel, ChainClient};

use crate::config::Settings;
use crate::error::{TransferError, TransferResult};
use crate::types::{amount_from_u256, parse_address, Amount};
use crate::wallet::{Account, HdWallet};

use dashmap::DashMap;
use ethers::prelude::*;
use ethers::providers::{Http, JsonRpcClient, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Builds chain clients from an RPC URL and, for signing clients, a key
#[derive(Debug, Clone)]
pub struct ClientFactory {
    request_timeout: Duration,
}

impl ClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    fn provider(rpc_url: &str) -> TransferResult<Provider<Http>> {
        url::Url::parse(rpc_url)
            .map_err(|e| TransferError::validation("rpc_url", format!("'{}': {}", rpc_url, e)))?;
        Provider::<Http>::try_from(rpc_url)
            .map_err(|e| TransferError::validation("rpc_url", format!("'{}': {}", rpc_url, e)))
    }

    /// Read-only client; the chain id is asked from the endpoint
    pub async fn create_client(&self, rpc_url: &str) -> TransferResult<ChainClient> {
        let provider = Self::provider(rpc_url)?;
        let chain_id = match timeout(self.request_timeout, provider.get_chainid()).await {
            Ok(Ok(id)) => id.as_u64(),
            Ok(Err(e)) => return Err(TransferError::transport("get_chain_id", rpc_url, e)),
            Err(_) => {
                return Err(TransferError::transport(
                    "get_chain_id",
                    rpc_url,
                    format!("request timed out after {:?}", self.request_timeout),
                ))
            }
        };
        debug!("Read-only client for chain {} at {}", chain_id, rpc_url);
        self.read_only_client(rpc_url, chain_id)
    }

    /// Read-only client for a known chain id, without a round trip
    pub fn read_only_client(&self, rpc_url: &str, chain_id: u64) -> TransferResult<ChainClient> {
        let provider = Self::provider(rpc_url)?;
        Ok(ChainClient::new(provider, rpc_url, chain_id, None, self.request_timeout))
    }

    /// Client that signs with a raw private key
    pub fn create_signing_client(
        &self,
        private_key: &str,
        chain_id: u64,
        rpc_url: &str,
    ) -> TransferResult<ChainClient> {
        let account = Account::from_private_key(private_key, chain_id)?;
        self.client_for_account(account, rpc_url)
    }

    /// Client that signs with HD wallet account `index`
    pub fn create_hd_client(
        &self,
        wallet: &HdWallet,
        index: u32,
        chain_id: u64,
        rpc_url: &str,
    ) -> TransferResult<ChainClient> {
        let account = wallet.account(index, chain_id)?;
        self.client_for_account(account, rpc_url)
    }

    /// Client that signs with the HD wallet account controlling `address`
    pub fn create_hd_client_for_address(
        &self,
        wallet: &HdWallet,
        address: Address,
        chain_id: u64,
        rpc_url: &str,
        scan_limit: u32,
    ) -> TransferResult<ChainClient> {
        let account = wallet.account_for_address(address, chain_id, scan_limit)?;
        self.client_for_account(account, rpc_url)
    }

    fn client_for_account(&self, account: Account, rpc_url: &str) -> TransferResult<ChainClient> {
        let provider = Self::provider(rpc_url)?;
        let chain_id = account.chain_id();
        info!("Signing client for {:?} on chain {}", account.address(), chain_id);
        Ok(ChainClient::new(
            provider,
            rpc_url,
            chain_id,
            Some(account.into_signer()),
            self.request_timeout,
        ))
    }
}

/// Native balance of `address`
pub async fn get_balance<P: JsonRpcClient>(
    client: &ChainClient<P>,
    address: Address,
) -> TransferResult<Amount> {
    Ok(amount_from_u256(client.get_balance(address).await?))
}

/// ERC20 `balanceOf(owner)`
pub async fn get_erc20_balance<P: JsonRpcClient>(
    client: &ChainClient<P>,
    contract: Address,
    owner: Address,
) -> TransferResult<Amount> {
    token_balance(client, contract, owner, "erc20 balanceOf").await
}

/// ERC721 `balanceOf(owner)`: number of tokens held
pub async fn get_erc721_balance<P: JsonRpcClient>(
    client: &ChainClient<P>,
    contract: Address,
    owner: Address,
) -> TransferResult<Amount> {
    token_balance(client, contract, owner, "erc721 balanceOf").await
}

async fn token_balance<P: JsonRpcClient>(
    client: &ChainClient<P>,
    contract: Address,
    owner: Address,
    operation: &'static str,
) -> TransferResult<Amount> {
    let tx: TypedTransaction = TransactionRequest::new()
        .to(contract)
        .data(erc::balance_of(owner))
        .into();
    let output = client.call(&tx, operation).await?;
    Ok(amount_from_u256(erc::decode_uint(contract, &output)?))
}

pub async fn last_block_number<P: JsonRpcClient>(client: &ChainClient<P>) -> TransferResult<u64> {
    client.block_number().await
}

pub async fn transaction_by_hash<P: JsonRpcClient>(
    client: &ChainClient<P>,
    hash: H256,
) -> TransferResult<Option<Transaction>> {
    client.transaction_by_hash(hash).await
}

/// Clients for every enabled chain, indexed by chain ID
pub struct ChainRegistry {
    clients: DashMap<u64, Arc<ChainClient>>,
    names: DashMap<u64, String>,
}

impl ChainRegistry {
    pub fn from_settings(settings: &Settings) -> TransferResult<Self> {
        let factory = ClientFactory::new(settings.rpc.request_timeout());
        let clients = DashMap::new();
        let names = DashMap::new();

        for (name, chain) in settings.enabled_chains() {
            let private_key = chain.private_key.as_deref().filter(|k| !k.is_empty());
            let mnemonic = chain.mnemonic.as_deref().filter(|m| !m.is_empty());

            let client = match (private_key, mnemonic) {
                (Some(key), _) => factory.create_signing_client(key, chain.chain_id, &chain.rpc_url)?,
                (None, Some(phrase)) => {
                    let wallet =
                        HdWallet::from_phrase(phrase, chain.passphrase.as_deref().unwrap_or(""))?;
                    match chain.account_address.as_deref() {
                        Some(address) => factory.create_hd_client_for_address(
                            &wallet,
                            parse_address("account_address", address)?,
                            chain.chain_id,
                            &chain.rpc_url,
                            settings.wallet.address_scan_limit,
                        )?,
                        None => factory.create_hd_client(
                            &wallet,
                            chain.account_index.unwrap_or(0),
                            chain.chain_id,
                            &chain.rpc_url,
                        )?,
                    }
                }
                (None, None) => {
                    warn!("Chain {} has no signing key - read-only", name);
                    factory.read_only_client(&chain.rpc_url, chain.chain_id)?
                }
            };

            info!("Chain {} (ID: {}) at {}", name, chain.chain_id, chain.rpc_url);
            clients.insert(chain.chain_id, Arc::new(client));
            names.insert(chain.chain_id, name.clone());
        }

        Ok(Self { clients, names })
    }

    pub fn get(&self, chain_id: u64) -> TransferResult<Arc<ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or_else(|| {
                TransferError::validation("chain_id", format!("chain {} is not configured", chain_id))
            })
    }

    pub fn name(&self, chain_id: u64) -> Option<String> {
        self.names.get(&chain_id).map(|n| n.clone())
    }

    /// Configured chain IDs, ascending
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Block number per chain; `None` for chains that did not answer
    pub async fn health_check(&self) -> Vec<(u64, Option<u64>)> {
        let mut results = Vec::new();

        for chain_id in self.chain_ids() {
            let Ok(client) = self.get(chain_id) else {
                continue;
            };
            let block = match client.block_number().await {
                Ok(block) => Some(block),
                Err(e) => {
                    warn!("Chain {} health check failed: {}", chain_id, e);
                    None
                }
            };
            crate::metrics::record_chain_health(chain_id, block);
            results.push((chain_id, block));
        }

        results
    }
}
