//! Signing accounts and BIP39/BIP44 hierarchical-deterministic wallets

use crate::error::{TransferError, TransferResult};

use bip39::{Language, Mnemonic};
use ethers::signers::coins_bip39::English;
use ethers::signers::{LocalWallet, MnemonicBuilder, Signer};
use ethers::types::Address;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tracing::{debug, info};

/// A signing account: address plus the key that controls it
#[derive(Clone)]
pub struct Account {
    wallet: LocalWallet,
}

impl Account {
    /// Parse a hex private key (with or without `0x`)
    pub fn from_private_key(private_key: &str, chain_id: u64) -> TransferResult<Self> {
        let key = private_key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| TransferError::wallet("invalid private key", e))?;
        Ok(Self {
            wallet: wallet.with_chain_id(chain_id),
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.wallet.chain_id()
    }

    pub fn into_signer(self) -> LocalWallet {
        self.wallet
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id())
            .finish()
    }
}

/// Mnemonic length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCount {
    Twelve,
    Fifteen,
    Eighteen,
    TwentyOne,
    TwentyFour,
}

impl WordCount {
    fn entropy_bytes(self) -> usize {
        match self {
            WordCount::Twelve => 16,
            WordCount::Fifteen => 20,
            WordCount::Eighteen => 24,
            WordCount::TwentyOne => 28,
            WordCount::TwentyFour => 32,
        }
    }

    pub fn words(self) -> usize {
        self.entropy_bytes() * 3 / 4
    }
}

/// Ethereum BIP44 path for an account index
pub fn derivation_path(index: u32) -> String {
    format!("m/44'/60'/0'/0/{}", index)
}

/// HD wallet: a mnemonic and optional passphrase from which accounts are derived
pub struct HdWallet {
    mnemonic: SecretString,
    passphrase: SecretString,
}

impl fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HdWallet { .. }")
    }
}

impl HdWallet {
    /// Generate a fresh wallet from OS randomness
    pub fn generate(passphrase: &str, word_count: WordCount) -> TransferResult<Self> {
        let mut entropy = vec![0u8; word_count.entropy_bytes()];
        rand::thread_rng().fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
            .map_err(|e| TransferError::wallet("cannot generate wallet", e))?;

        info!("Generated new {}-word HD wallet", word_count.words());
        Ok(Self {
            mnemonic: SecretString::new(mnemonic.to_string()),
            passphrase: SecretString::new(passphrase.to_string()),
        })
    }

    /// Restore a wallet from its word list
    pub fn restore<S: AsRef<str>>(words: &[S], passphrase: &str) -> TransferResult<Self> {
        let phrase = words
            .iter()
            .map(|w| w.as_ref().trim())
            .collect::<Vec<_>>()
            .join(" ");
        Self::from_phrase(&phrase, passphrase)
    }

    /// Restore a wallet from a space-separated phrase
    pub fn from_phrase(phrase: &str, passphrase: &str) -> TransferResult<Self> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
            .map_err(|e| TransferError::wallet("cannot restore wallet", e))?;

        Ok(Self {
            mnemonic: SecretString::new(mnemonic.to_string()),
            passphrase: SecretString::new(passphrase.to_string()),
        })
    }

    /// Words of the mnemonic; handle with care
    pub fn words(&self) -> Vec<String> {
        self.mnemonic
            .expose_secret()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Derive the account at `index` for signing on `chain_id`
    pub fn account(&self, index: u32, chain_id: u64) -> TransferResult<Account> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.expose_secret().as_str())
            .password(self.passphrase.expose_secret())
            .derivation_path(&derivation_path(index))
            .and_then(|builder| builder.build())
            .map_err(|e| TransferError::wallet(format!("cannot derive account {}", index), e))?;

        Ok(Account {
            wallet: wallet.with_chain_id(chain_id),
        })
    }

    /// Find the account controlling `address` among the first `scan_limit` indices
    pub fn account_for_address(
        &self,
        address: Address,
        chain_id: u64,
        scan_limit: u32,
    ) -> TransferResult<Account> {
        for index in 0..scan_limit {
            let account = self.account(index, chain_id)?;
            if account.address() == address {
                debug!("Resolved {:?} at derivation index {}", address, index);
                return Ok(account);
            }
        }
        Err(TransferError::validation(
            "address",
            format!(
                "{:?} is not among the first {} accounts of this wallet",
                address, scan_limit
            ),
        ))
    }
}
