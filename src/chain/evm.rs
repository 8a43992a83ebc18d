//! EVM `ChainClient` backed by an Alloy JSON-RPC provider.
//!
//! The nonce cache is lifted near-verbatim from
//! `PendingNonceManager` (`chain/eip155/pending_nonce_manager.rs`): query
//! `.pending()` once per process lifetime, then increment locally, with a
//! `reset_nonce` escape hatch for submit failures. The Nonce Dispatcher
//! (`crate::nonce`) wraps this with the exclusive-lock-across-sign-and-submit
//! discipline spec.md §4.3 requires; this module only owns the cache.

use alloy_primitives::{Address, Bytes};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types_eth::BlockId;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use super::{
    Block, ChainClient, ChainClientError, ChainErrorType, Receipt, SignedPayload, SubmitError,
    SubmitOutcome,
};

const NONCE_UNSET: u64 = u64::MAX;

/// Per-address nonce cache, querying `.pending()` lazily on first use.
#[derive(Clone, Debug, Default)]
struct PendingNonceCache {
    nonce: Arc<Mutex<u64>>,
}

impl PendingNonceCache {
    fn new() -> Self {
        Self {
            nonce: Arc::new(Mutex::new(NONCE_UNSET)),
        }
    }

    async fn next(&self, provider: &RootProvider, address: Address) -> Result<u64, ChainClientError> {
        let mut guard = self.nonce.lock().await;
        let new_nonce = if *guard == NONCE_UNSET {
            tracing::trace!(%address, "fetching initial nonce via .pending()");
            provider
                .get_transaction_count(address)
                .pending()
                .await
                .map_err(|e| ChainClientError::Transport(e.to_string()))?
        } else {
            *guard + 1
        };
        *guard = new_nonce;
        Ok(new_nonce)
    }

    async fn reset(&self) {
        let mut guard = self.nonce.lock().await;
        *guard = NONCE_UNSET;
        tracing::debug!("reset cached nonce, will requery on next use");
    }
}

pub struct EvmChainClient {
    provider: RootProvider,
    address: Address,
    nonce_cache: PendingNonceCache,
}

impl EvmChainClient {
    pub async fn connect(rpc_url: &Url, address: Address) -> Result<Self, ChainClientError> {
        let provider = ProviderBuilder::new()
            .connect_http(rpc_url.clone())
            .root()
            .clone();
        Ok(Self {
            provider,
            address,
            nonce_cache: PendingNonceCache::new(),
        })
    }

    #[cfg(test)]
    pub fn from_provider(provider: RootProvider, address: Address) -> Self {
        Self {
            provider,
            address,
            nonce_cache: PendingNonceCache::new(),
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn submit_transaction(&self, payload: SignedPayload) -> Result<SubmitOutcome, SubmitError> {
        let raw = Bytes::from(payload.raw);
        match self.provider.send_raw_transaction(&raw).await {
            Ok(pending) => {
                let tx_hash = format!("{:#x}", pending.tx_hash());
                Ok(SubmitOutcome {
                    nonce: payload.nonce,
                    tx_hash,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let error_type = classify_submit_error(&message);
                Err(SubmitError { error_type, message })
            }
        }
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, ChainClientError> {
        let hash: alloy_primitives::B256 = tx_hash
            .parse()
            .map_err(|e| ChainClientError::Transport(format!("bad tx hash {tx_hash}: {e}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainClientError::Transport(e.to_string()))?;
        Ok(receipt.map(|r| Receipt {
            status: if r.status() { 1 } else { 0 },
            block_number: r.block_number.unwrap_or_default(),
        }))
    }

    async fn get_block(&self, num: u64) -> Result<Block, ChainClientError> {
        let block = self
            .provider
            .get_block(BlockId::number(num))
            .await
            .map_err(|e| ChainClientError::Transport(e.to_string()))?
            .ok_or(ChainClientError::BlockNotFound(num))?;
        let transactions = block
            .transactions
            .hashes()
            .map(|h| format!("{:#x}", h))
            .collect();
        Ok(Block {
            number: num,
            transactions,
            timestamp: block.header.timestamp,
        })
    }

    async fn current_head(&self) -> Result<u64, ChainClientError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainClientError::Transport(e.to_string()))
    }

    async fn gas_price_fast_wei(&self) -> Result<u128, ChainClientError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainClientError::Transport(e.to_string()))
    }

    async fn next_nonce(&self) -> Result<u64, ChainClientError> {
        self.nonce_cache.next(&self.provider, self.address).await
    }

    async fn reset_nonce(&self) {
        self.nonce_cache.reset().await
    }
}

/// Best-effort classification of a provider error message into a `ChainErrorType`.
/// Real RPC nodes don't agree on a structured error taxonomy, so this mirrors
/// the common habit of matching on substrings for venue-specific replies
/// (spec.md §7 "Race errors").
fn classify_submit_error(message: &str) -> ChainErrorType {
    let lower = message.to_lowercase();
    if lower.contains("nonce too low") || lower.contains("nonce is too low") {
        ChainErrorType::InvalidNonce
    } else if lower.contains("insufficient funds") {
        ChainErrorType::InsufficientFunds
    } else if lower.contains("revert") || lower.contains("execution failed") {
        ChainErrorType::TransactionFailed
    } else {
        ChainErrorType::Other
    }
}
