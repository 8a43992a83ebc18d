//! Reference EVM venue adaptor: ERC-20 `approve`/`transfer`, a generic
//! order-submission call against a single DEX router contract, and
//! WETH-style wrap/unwrap, the "one reference venue adaptor" this repo ships
//! alongside the venue-agnostic core.
//!
//! The `sol!` ABI-binding style and `SolCall::abi_encode` usage follow the
//! `chain/evm.rs`, narrowed to the split `alloy-sol-types` crate
//! this repo depends on rather than an `alloy` umbrella crate.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall};

use crate::adaptor::{AdaptorError, BuiltCall, VenueAdaptor, VenueId};
use crate::request::{DexSpecific, RequestDetails, WrapOperation};

sol! {
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

sol! {
    interface IWeth {
        function deposit() external payable;
        function withdraw(uint256 amount) external;
    }
}

sol! {
    interface IReferenceRouter {
        function placeOrder(bytes32 symbol, bool isBuy, uint256 quantity, uint256 price, uint8 orderType) external returns (bytes32 orderId);
        function cancelOrder(bytes32 orderId) external;
    }
}

fn symbol_to_bytes32(symbol: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let bytes = symbol.as_bytes();
    let len = bytes.len().min(32);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Resolves token symbols to on-chain addresses. The reference adaptor keeps
/// this as a flat map rather than an on-chain registry lookup — real venues
/// would source this from config or a factory contract.
pub struct EvmReferenceAdaptor {
    router: Address,
    token_addresses: std::collections::HashMap<String, Address>,
}

impl EvmReferenceAdaptor {
    pub fn new(router: Address, token_addresses: std::collections::HashMap<String, Address>) -> Self {
        Self {
            router,
            token_addresses,
        }
    }

    fn token(&self, symbol: &str) -> Result<Address, AdaptorError> {
        self.token_addresses
            .get(symbol)
            .copied()
            .ok_or_else(|| AdaptorError::UnsupportedRequest(format!("unknown token symbol {symbol}")))
    }

    fn parse_amount(amount: &str) -> Result<U256, AdaptorError> {
        amount
            .parse()
            .map_err(|_| AdaptorError::Encoding(format!("not a base-unit integer: {amount}")))
    }
}

impl VenueId for EvmReferenceAdaptor {
    fn id(&self) -> &str {
        "evm-reference"
    }
}

#[async_trait::async_trait]
impl VenueAdaptor for EvmReferenceAdaptor {
    async fn build_call(
        &self,
        details: &RequestDetails,
        _nonce: u64,
        _gas_price_wei: u128,
    ) -> Result<BuiltCall, AdaptorError> {
        match details {
            RequestDetails::Approve { symbol, amount } => {
                let token = self.token(symbol)?;
                let amount = Self::parse_amount(amount)?;
                let call = IERC20::approveCall {
                    spender: self.router,
                    amount,
                };
                Ok(BuiltCall {
                    to: token,
                    calldata: Bytes::from(call.abi_encode()),
                    value: U256::ZERO,
                    dex_specific: DexSpecific::default(),
                })
            }
            RequestDetails::Transfer {
                symbol,
                amount,
                address_to,
                ..
            } => {
                let token = self.token(symbol)?;
                let amount = Self::parse_amount(amount)?;
                let to: Address = address_to
                    .parse()
                    .map_err(|_| AdaptorError::UnsupportedRequest(format!("bad address_to: {address_to}")))?;
                let call = IERC20::transferCall { to, amount };
                Ok(BuiltCall {
                    to: token,
                    calldata: Bytes::from(call.abi_encode()),
                    value: U256::ZERO,
                    dex_specific: DexSpecific::default(),
                })
            }
            RequestDetails::Order {
                symbol,
                side,
                quantity,
                price,
                order_type,
            } => {
                let quantity = Self::parse_amount(quantity)?;
                let price = Self::parse_amount(price)?;
                let order_type_code = match order_type.as_str() {
                    "LIMIT" => 0u8,
                    "MARKET" => 1u8,
                    other => {
                        return Err(AdaptorError::UnsupportedRequest(format!("unknown order_type {other}")));
                    }
                };
                let call = IReferenceRouter::placeOrderCall {
                    symbol: symbol_to_bytes32(symbol).into(),
                    isBuy: side.eq_ignore_ascii_case("BUY"),
                    quantity,
                    price,
                    orderType: order_type_code,
                };
                Ok(BuiltCall {
                    to: self.router,
                    calldata: Bytes::from(call.abi_encode()),
                    value: U256::ZERO,
                    dex_specific: DexSpecific::default(),
                })
            }
            RequestDetails::WrapUnwrap { symbol, amount, operation } => {
                let weth = self.token(symbol)?;
                let amount = Self::parse_amount(amount)?;
                match operation {
                    WrapOperation::Wrap => {
                        let call = IWeth::depositCall {};
                        Ok(BuiltCall {
                            to: weth,
                            calldata: Bytes::from(call.abi_encode()),
                            value: amount,
                            dex_specific: DexSpecific::default(),
                        })
                    }
                    WrapOperation::Unwrap => {
                        let call = IWeth::withdrawCall { amount };
                        Ok(BuiltCall {
                            to: weth,
                            calldata: Bytes::from(call.abi_encode()),
                            value: U256::ZERO,
                            dex_specific: DexSpecific::default(),
                        })
                    }
                }
            }
        }
    }

    async fn build_cancel(&self, nonce: u64, _gas_price_wei: u128) -> Result<BuiltCall, AdaptorError> {
        // The reference router has no on-chain order id for a purely local
        // cancel, so a cancel here just resubmits a no-op self-call at the
        // same nonce to consume it (spec.md §4.1 cancel-request semantics).
        let _ = nonce;
        Ok(BuiltCall {
            to: self.router,
            calldata: Bytes::new(),
            value: U256::ZERO,
            dex_specific: DexSpecific::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn adaptor() -> EvmReferenceAdaptor {
        let router: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
        let mut tokens = HashMap::new();
        tokens.insert(
            "USDC".to_string(),
            "0x0000000000000000000000000000000000000002".parse::<Address>().unwrap(),
        );
        EvmReferenceAdaptor::new(router, tokens)
    }

    #[tokio::test]
    async fn approve_encodes_spender_as_router() {
        let a = adaptor();
        let details = RequestDetails::Approve {
            symbol: "USDC".into(),
            amount: "1000000".into(),
        };
        let built = a.build_call(&details, 0, 0).await.unwrap();
        assert_eq!(built.to, a.token("USDC").unwrap());
        assert!(!built.calldata.is_empty());
    }

    #[tokio::test]
    async fn order_rejects_unknown_order_type() {
        let a = adaptor();
        let details = RequestDetails::Order {
            symbol: "BTC-USD".into(),
            side: "BUY".into(),
            quantity: "1".into(),
            price: "1".into(),
            order_type: "ICEBERG".into(),
        };
        assert!(a.build_call(&details, 0, 0).await.is_err());
    }

    #[tokio::test]
    async fn wrap_sends_amount_as_value_to_weth() {
        let a = adaptor();
        let details = RequestDetails::WrapUnwrap {
            symbol: "USDC".into(),
            amount: "1000000".into(),
            operation: WrapOperation::Wrap,
        };
        let built = a.build_call(&details, 0, 0).await.unwrap();
        assert_eq!(built.to, a.token("USDC").unwrap());
        assert_eq!(built.value, U256::from(1_000_000u64));
        assert!(!built.calldata.is_empty());
    }

    #[tokio::test]
    async fn unwrap_encodes_withdraw_with_zero_value() {
        let a = adaptor();
        let details = RequestDetails::WrapUnwrap {
            symbol: "USDC".into(),
            amount: "500".into(),
            operation: WrapOperation::Unwrap,
        };
        let built = a.build_call(&details, 0, 0).await.unwrap();
        assert_eq!(built.to, a.token("USDC").unwrap());
        assert_eq!(built.value, U256::ZERO);
        assert!(!built.calldata.is_empty());
    }

    #[tokio::test]
    async fn wrap_unwrap_rejects_unknown_symbol() {
        let a = adaptor();
        let details = RequestDetails::WrapUnwrap {
            symbol: "DOGE".into(),
            amount: "1".into(),
            operation: WrapOperation::Wrap,
        };
        assert!(a.build_call(&details, 0, 0).await.is_err());
    }
}
