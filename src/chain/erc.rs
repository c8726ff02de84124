//! ERC20 / ERC721 call data for the standard methods we invoke

use crate::error::{TransferError, TransferResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

pub const BALANCE_OF: &str = "balanceOf(address)";
pub const ERC20_TRANSFER: &str = "transfer(address,uint256)";
pub const ERC721_TRANSFER_FROM: &str = "transferFrom(address,address,uint256)";

fn encode_call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

/// `balanceOf(owner)`, shared by ERC20 and ERC721
pub fn balance_of(owner: Address) -> Bytes {
    encode_call(BALANCE_OF, &[Token::Address(owner)])
}

/// ERC20 `transfer(to, amount)`
pub fn erc20_transfer(to: Address, amount: U256) -> Bytes {
    encode_call(ERC20_TRANSFER, &[Token::Address(to), Token::Uint(amount)])
}

/// ERC721 `transferFrom(from, to, tokenId)`
pub fn erc721_transfer_from(from: Address, to: Address, token_id: U256) -> Bytes {
    encode_call(
        ERC721_TRANSFER_FROM,
        &[Token::Address(from), Token::Address(to), Token::Uint(token_id)],
    )
}

/// Decode a single `uint256` return value
pub fn decode_uint(contract: Address, output: &[u8]) -> TransferResult<U256> {
    let tokens = abi::decode(&[ParamType::Uint(256)], output).map_err(|e| {
        TransferError::transport("decode balanceOf", format!("{:?}", contract), e)
    })?;
    match tokens.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(TransferError::transport(
            "decode balanceOf",
            format!("{:?}", contract),
            format!("unexpected return value {:?}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_match_the_standards() {
        assert_eq!(hex::encode(&balance_of(Address::zero())[..4]), "70a08231");
        assert_eq!(
            hex::encode(&erc20_transfer(Address::zero(), U256::zero())[..4]),
            "a9059cbb"
        );
        assert_eq!(
            hex::encode(&erc721_transfer_from(Address::zero(), Address::zero(), U256::zero())[..4]),
            "23b872dd"
        );
    }

    #[test]
    fn test_transfer_arguments_are_word_aligned() {
        let to = Address::repeat_byte(0x11);
        let data = erc20_transfer(to, U256::from(1_000u64));

        assert_eq!(data.len(), 4 + 32 * 2);
        assert_eq!(&data[4 + 12..4 + 32], to.as_bytes());
        assert_eq!(U256::from_big_endian(&data[36..68]), U256::from(1_000u64));
    }

    #[test]
    fn test_decode_uint() {
        let encoded = abi::encode(&[Token::Uint(U256::from(7u64))]);
        assert_eq!(decode_uint(Address::zero(), &encoded).unwrap(), U256::from(7u64));
        assert!(decode_uint(Address::zero(), &[0u8; 3]).is_err());
    }
}
