//! Chain Client contract (spec.md §6): the narrow interface the core consumes
//! to submit transactions, poll receipts, and track chain head.
//!
//! Grounded in `facilitator.rs`'s trait style (a small async trait,
//! implementors returning a typed error), specialized here to the single
//! reference EVM venue this repo ships ("core plus one reference venue
//! adaptor" budget).

pub mod evm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// `ErrorType` returned by `submit_transaction` on failure (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainErrorType {
    NoError,
    TransactionFailed,
    InvalidNonce,
    InsufficientFunds,
    Other,
}

#[derive(Debug, Clone)]
pub struct SubmitError {
    pub error_type: ChainErrorType,
    pub message: String,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for SubmitError {}

impl SubmitError {
    /// Matches the venue-reply strings the Lifecycle Manager treats specially
    /// (spec.md §4.1 cancel-request, §7 race errors).
    pub fn is_nonce_too_low(&self) -> bool {
        self.error_type == ChainErrorType::InvalidNonce
            || self.message.to_lowercase().contains("nonce too low")
    }

    pub fn is_already_mined(&self) -> bool {
        self.message.to_lowercase().contains("already mined")
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub nonce: u64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// `1` success, `0` failure, matching the chain's raw receipt status.
    pub status: u8,
    pub block_number: u64,
}

impl Receipt {
    pub fn succeeded(self) -> bool {
        self.status == 1
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub transactions: Vec<String>,
    pub timestamp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("block not found: {0}")]
    BlockNotFound(u64),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A signed, venue-opaque payload ready for submission.
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub raw: Vec<u8>,
    pub nonce: u64,
    pub gas_price_wei: Option<u128>,
}

/// What the core needs from a chain backend (spec.md §6 "Chain client contract").
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn submit_transaction(&self, payload: SignedPayload) -> Result<SubmitOutcome, SubmitError>;
    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, ChainClientError>;
    async fn get_block(&self, num: u64) -> Result<Block, ChainClientError>;
    async fn current_head(&self) -> Result<u64, ChainClientError>;
    /// Fast-tier gas price oracle reading, used to derive cancel gas (spec.md §4.1).
    async fn gas_price_fast_wei(&self) -> Result<u128, ChainClientError>;
    /// Reserves the next nonce for `address` without submitting anything.
    /// Errors are transient RPC failures, not "no nonce available" — the
    /// Nonce Dispatcher retries indefinitely rather than defaulting to a
    /// guessed value (spec.md §4.1).
    async fn next_nonce(&self) -> Result<u64, ChainClientError>;
    /// Forces the next `next_nonce()` call to re-query the chain (spec.md §4.3: a
    /// failed submit at a stale nonce should not poison the local cache).
    async fn reset_nonce(&self);
}
