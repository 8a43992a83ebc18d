//! Request Lifecycle Manager (spec.md §4.1).
//!
//! Grounded in `facilitator_local.rs`'s assert-then-act structure
//! (`#[instrument(skip(self), err)]` per operation) and `handlers.rs`'s
//! per-error-variant `IntoResponse` mapping. Owns every other core
//! component and is the
//! only thing that mutates a `Request` outside of the Poller's terminal
//! transition.

use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use crate::adaptor::VenueAdaptor;
use crate::cache::RequestCache;
use crate::chain::{ChainClient, ChainErrorType, Receipt};
use crate::events::EventDispatcher;
use crate::nonce::NonceDispatcher;
use crate::poller::{StatusCallback, StatusPoller};
use crate::request::{to_dict, ActionTag, Request, RequestDetails, RequestStatus, RequestType, WrapOperation};
use crate::signer::SignerPool;
use crate::whitelist::Whitelist;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("client_request_id={0} is already known")]
    DuplicateRequest(String),
    #[error("gas_price_wei {submitted} exceeds max_allowed_gas_price_wei {max}")]
    GasPriceCapExceeded { submitted: u128, max: u128 },
    #[error("Unknown withdrawal_address={address_to} for token={symbol}")]
    UnknownWithdrawal { symbol: String, address_to: String },
    #[error("client_request_id={0} not found")]
    NotFound(String),
    #[error("client_request_id={0} is not PENDING")]
    NotPending(String),
    #[error("cancel already in progress for client_request_id={0}")]
    AlreadyInProgress(String),
    #[error("cancel window closed for client_request_id={0}")]
    CancelWindowClosed(String),
    #[error("RETRY. Insert pending")]
    NonceNotYetAssigned,
    #[error("venue error {error_type:?}: {message}")]
    Venue {
        error_type: ChainErrorType,
        message: String,
    },
    #[error("{0}")]
    Internal(String),
}

impl From<crate::cache::DuplicateRequest> for LifecycleError {
    fn from(value: crate::cache::DuplicateRequest) -> Self {
        LifecycleError::DuplicateRequest(value.0)
    }
}

/// Per-request gas price ceiling, already converted to wei at construction
/// (spec.md §6 `max_allowed_gas_price_gwei`).
pub struct LifecycleManager {
    cache: Arc<RequestCache>,
    nonce: Arc<NonceDispatcher>,
    poller: Arc<StatusPoller>,
    adaptor: Arc<dyn VenueAdaptor>,
    signer: Arc<SignerPool>,
    events: Arc<EventDispatcher>,
    chain: Arc<dyn ChainClient>,
    whitelist: Arc<Whitelist>,
    max_allowed_gas_price_wei: u128,
}

#[derive(Debug, Serialize)]
pub struct SubmitResult {
    pub tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CancelAllResult {
    pub cancel_requested: Vec<String>,
    pub failed_cancels: Vec<String>,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<RequestCache>,
        nonce: Arc<NonceDispatcher>,
        poller: Arc<StatusPoller>,
        adaptor: Arc<dyn VenueAdaptor>,
        signer: Arc<SignerPool>,
        events: Arc<EventDispatcher>,
        chain: Arc<dyn ChainClient>,
        whitelist: Arc<Whitelist>,
        max_allowed_gas_price_gwei: u64,
    ) -> Self {
        Self {
            cache,
            nonce,
            poller,
            adaptor,
            signer,
            events,
            chain,
            whitelist,
            max_allowed_gas_price_wei: max_allowed_gas_price_gwei as u128 * 1_000_000_000,
        }
    }

    fn check_gas_cap(&self, gas_price_wei: u128) -> Result<(), LifecycleError> {
        if gas_price_wei > self.max_allowed_gas_price_wei {
            return Err(LifecycleError::GasPriceCapExceeded {
                submitted: gas_price_wei,
                max: self.max_allowed_gas_price_wei,
            });
        }
        Ok(())
    }

    /// Shared insert path for approve/transfer/insert-order (spec.md §4.1:
    /// "identical to approve" for transfer once the whitelist check passes).
    async fn insert(&self, client_request_id: &str, details: RequestDetails, gas_price_wei: u128) -> Result<SubmitResult, LifecycleError> {
        self.check_gas_cap(gas_price_wei)?;

        let request = Request::new(client_request_id, details.clone(), now_ms());
        self.cache.add(request)?;

        let guard = self.nonce.lock().await;
        let nonce = guard.nonce();

        let built = self
            .adaptor
            .build_call(&details, nonce, gas_price_wei)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()));
        let built = match built {
            Ok(b) => b,
            Err(err) => {
                self.cache.finalise_request(client_request_id, RequestStatus::Failed);
                return Err(err);
            }
        };

        let action_tag: ActionTag = details.request_type().into();
        let dex_specific = built.dex_specific.clone();
        let signed = self.signer.sign(built, nonce, gas_price_wei).await;
        let signed = match signed {
            Ok(s) => s,
            Err(err) => {
                self.cache.finalise_request(client_request_id, RequestStatus::Failed);
                return Err(LifecycleError::Internal(err.to_string()));
            }
        };

        match self.chain.submit_transaction(signed).await {
            Ok(outcome) => {
                drop(guard);
                self.cache.mutate(client_request_id, |r| {
                    r.nonce = Some(outcome.nonce);
                    r.dex_specific = dex_specific;
                    r.push_attempt(outcome.tx_hash.clone(), action_tag, Some(gas_price_wei));
                });
                self.poller.add_for_polling(outcome.tx_hash.clone(), client_request_id, action_tag);
                Ok(SubmitResult {
                    tx_hash: outcome.tx_hash,
                    nonce: Some(outcome.nonce),
                })
            }
            Err(err) => {
                if err.is_nonce_too_low() {
                    guard.fail_nonce_too_low().await;
                } else {
                    drop(guard);
                }
                self.cache.finalise_request(client_request_id, RequestStatus::Failed);
                Err(LifecycleError::Venue {
                    error_type: err.error_type,
                    message: err.message,
                })
            }
        }
    }

    #[instrument(skip(self), err)]
    pub async fn approve(&self, client_request_id: &str, symbol: &str, amount: &str, gas_price_wei: u128) -> Result<SubmitResult, LifecycleError> {
        let details = RequestDetails::Approve {
            symbol: symbol.to_string(),
            amount: amount.to_string(),
        };
        self.insert(client_request_id, details, gas_price_wei).await
    }

    #[instrument(skip(self), err)]
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: &str,
        address_to: &str,
        request_path: &str,
        gas_price_wei: u128,
    ) -> Result<SubmitResult, LifecycleError> {
        if request_path == "/private/withdraw" && !self.whitelist.check(symbol, address_to) {
            return Err(LifecycleError::UnknownWithdrawal {
                symbol: symbol.to_string(),
                address_to: address_to.to_string(),
            });
        }
        let details = RequestDetails::Transfer {
            symbol: symbol.to_string(),
            amount: amount.to_string(),
            address_to: address_to.to_string(),
            request_path: request_path.to_string(),
        };
        self.insert(client_request_id, details, gas_price_wei).await
    }

    #[instrument(skip(self), err)]
    pub async fn insert_order(&self, client_request_id: &str, details: RequestDetails, gas_price_wei: u128) -> Result<SubmitResult, LifecycleError> {
        self.insert(client_request_id, details, gas_price_wei).await
    }

    #[instrument(skip(self), err)]
    #[allow(clippy::too_many_arguments)]
    pub async fn wrap_unwrap(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: &str,
        operation: WrapOperation,
        gas_price_wei: u128,
    ) -> Result<SubmitResult, LifecycleError> {
        let details = RequestDetails::WrapUnwrap {
            symbol: symbol.to_string(),
            amount: amount.to_string(),
            operation,
        };
        self.insert(client_request_id, details, gas_price_wei).await
    }

    #[instrument(skip(self), err)]
    pub async fn amend_request(&self, client_request_id: &str, details: RequestDetails, gas_price_wei: u128) -> Result<SubmitResult, LifecycleError> {
        self.check_gas_cap(gas_price_wei)?;
        let request = self.cache.get(client_request_id).ok_or_else(|| LifecycleError::NotFound(client_request_id.to_string()))?;
        if request.request_status != RequestStatus::Pending {
            return Err(LifecycleError::NotPending(client_request_id.to_string()));
        }
        let nonce = request.nonce.ok_or(LifecycleError::NonceNotYetAssigned)?;

        let _guard = self.nonce.hold().await;
        let built = self
            .adaptor
            .build_call(&details, nonce, gas_price_wei)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;
        let action_tag: ActionTag = details.request_type().into();
        let signed = self
            .signer
            .sign(built, nonce, gas_price_wei)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;

        match self.chain.submit_transaction(signed).await {
            Ok(outcome) => {
                self.cache.mutate(client_request_id, |r| {
                    r.push_attempt(outcome.tx_hash.clone(), action_tag, Some(gas_price_wei));
                });
                self.poller.add_for_polling(outcome.tx_hash.clone(), client_request_id, action_tag);
                Ok(SubmitResult {
                    tx_hash: outcome.tx_hash,
                    nonce: Some(nonce),
                })
            }
            Err(err) => Err(LifecycleError::Venue {
                error_type: err.error_type,
                message: err.message,
            }),
        }
    }

    /// `cancel-request` (spec.md §4.1). `caller_gas_price_wei` is the
    /// caller-supplied override, if any.
    #[instrument(skip(self), err)]
    pub async fn cancel_request(&self, client_request_id: &str, caller_gas_price_wei: Option<u128>) -> Result<SubmitResult, LifecycleError> {
        let request = self.cache.get(client_request_id).ok_or_else(|| LifecycleError::NotFound(client_request_id.to_string()))?;
        if request.is_finalised() {
            return Err(LifecycleError::NotPending(client_request_id.to_string()));
        }
        let nonce = request.nonce.ok_or(LifecycleError::NonceNotYetAssigned)?;
        let last_used = request.last_used_gas_price().unwrap_or(0);

        let gas_price_wei = match caller_gas_price_wei {
            Some(g) => g,
            None => {
                let oracle_fast = self
                    .chain
                    .gas_price_fast_wei()
                    .await
                    .map_err(|e| LifecycleError::Internal(e.to_string()))?;
                let min_bump = last_used.saturating_mul(11).div_ceil(10);
                oracle_fast.max(min_bump)
            }
        };

        if request.request_status == RequestStatus::CancelRequested && gas_price_wei <= last_used {
            return Err(LifecycleError::AlreadyInProgress(client_request_id.to_string()));
        }

        let _guard = self.nonce.hold().await;
        let built = self
            .adaptor
            .build_cancel(nonce, gas_price_wei)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;
        let signed = self
            .signer
            .sign(built, nonce, gas_price_wei)
            .await
            .map_err(|e| LifecycleError::Internal(e.to_string()))?;

        match self.chain.submit_transaction(signed).await {
            Ok(outcome) => {
                self.cache.mutate(client_request_id, |r| {
                    let _ = r.transition(RequestStatus::CancelRequested, now_ms());
                    r.push_attempt(outcome.tx_hash.clone(), ActionTag::Cancel, Some(gas_price_wei));
                });
                self.poller.add_for_polling(outcome.tx_hash.clone(), client_request_id, ActionTag::Cancel);
                Ok(SubmitResult {
                    tx_hash: outcome.tx_hash,
                    nonce: None,
                })
            }
            Err(err) if err.is_nonce_too_low() || err.is_already_mined() => {
                Err(LifecycleError::CancelWindowClosed(client_request_id.to_string()))
            }
            Err(err) => Err(LifecycleError::Venue {
                error_type: err.error_type,
                message: err.message,
            }),
        }
    }

    #[instrument(skip(self))]
    pub async fn cancel_all(&self, request_type: Option<RequestType>) -> CancelAllResult {
        let open: Vec<String> = self
            .cache
            .get_all(request_type)
            .into_iter()
            .filter(|r| !r.is_finalised())
            .map(|r| r.client_request_id)
            .collect();

        let mut cancel_requested = Vec::new();
        let mut failed_cancels = Vec::new();
        for client_request_id in open {
            match self.cancel_request(&client_request_id, None).await {
                Ok(_) => cancel_requested.push(client_request_id),
                Err(_) => failed_cancels.push(client_request_id),
            }
        }
        CancelAllResult {
            cancel_requested,
            failed_cancels,
        }
    }

    pub fn get_all_open_requests(&self, request_type: Option<RequestType>) -> Vec<serde_json::Value> {
        self.cache
            .get_all(request_type)
            .into_iter()
            .filter(|r| !r.is_finalised())
            .map(|r| serde_json::Value::Object(to_dict(&r).into_iter().collect()))
            .collect()
    }

    pub fn get_request_status(&self, client_request_id: &str) -> Option<serde_json::Value> {
        self.cache
            .get(client_request_id)
            .map(|r| serde_json::Value::Object(to_dict(&r).into_iter().collect()))
    }
}

#[async_trait::async_trait]
impl StatusCallback for LifecycleManager {
    /// Breaks the Cache ↔ Poller ↔ Lifecycle Manager cycle (spec.md §9):
    /// finalises the Cache entry and, for ORDER-type requests, emits a
    /// terminal-status event (spec.md §4.5).
    async fn on_request_status_update(
        &self,
        client_request_id: &str,
        new_status: RequestStatus,
        _receipt: Option<Receipt>,
        _mined_tx_hash: Option<String>,
    ) {
        if !self.cache.finalise_request(client_request_id, new_status) {
            tracing::warn!(%client_request_id, "status update for unknown request");
            return;
        }
        if let Some(request) = self.cache.get(client_request_id) {
            if request.request_type() == RequestType::Order {
                let data = to_dict(&request);
                self.events.on_event(
                    crate::events::ORDER_CHANNEL,
                    serde_json::Value::Object(data.into_iter().collect()),
                );
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorError, BuiltCall, VenueId};
    use crate::chain::{Block, ChainClientError, SignedPayload, SubmitOutcome};
    use alloy_primitives::{Address, Bytes, U256};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeChain {
        next_nonce: AtomicU64,
        fail_nonce_too_low: bool,
    }

    #[async_trait::async_trait]
    impl ChainClient for FakeChain {
        async fn submit_transaction(&self, payload: SignedPayload) -> Result<SubmitOutcome, SubmitError> {
            if self.fail_nonce_too_low {
                return Err(SubmitError {
                    error_type: ChainErrorType::InvalidNonce,
                    message: "nonce too low".into(),
                });
            }
            Ok(SubmitOutcome {
                nonce: payload.nonce,
                tx_hash: format!("0x{:064x}", payload.nonce),
            })
        }
        async fn get_transaction_receipt(&self, _tx_hash: &str) -> Result<Option<Receipt>, ChainClientError> {
            Ok(None)
        }
        async fn get_block(&self, _num: u64) -> Result<Block, ChainClientError> {
            unimplemented!()
        }
        async fn current_head(&self) -> Result<u64, ChainClientError> {
            Ok(0)
        }
        async fn gas_price_fast_wei(&self) -> Result<u128, ChainClientError> {
            Ok(500_000_000)
        }
        async fn next_nonce(&self) -> Result<u64, ChainClientError> {
            Ok(self.next_nonce.fetch_add(1, Ordering::SeqCst))
        }
        async fn reset_nonce(&self) {}
    }

    struct FakeAdaptor;

    impl VenueId for FakeAdaptor {
        fn id(&self) -> &str {
            "fake"
        }
    }

    #[async_trait::async_trait]
    impl VenueAdaptor for FakeAdaptor {
        async fn build_call(&self, _details: &RequestDetails, _nonce: u64, _gas_price_wei: u128) -> Result<BuiltCall, AdaptorError> {
            Ok(BuiltCall {
                to: Address::ZERO,
                calldata: Bytes::new(),
                value: U256::ZERO,
                dex_specific: Default::default(),
            })
        }
        async fn build_cancel(&self, _nonce: u64, _gas_price_wei: u128) -> Result<BuiltCall, AdaptorError> {
            Ok(BuiltCall {
                to: Address::ZERO,
                calldata: Bytes::new(),
                value: U256::ZERO,
                dex_specific: Default::default(),
            })
        }
    }

    fn test_signer_pool() -> Arc<SignerPool> {
        let signer: alloy_signer_local::PrivateKeySigner = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318a"
            .parse()
            .unwrap();
        Arc::new(SignerPool::new(signer, 1, 2))
    }

    fn manager(fail_nonce_too_low: bool) -> LifecycleManager {
        let chain: Arc<dyn ChainClient> = Arc::new(FakeChain {
            next_nonce: AtomicU64::new(42),
            fail_nonce_too_low,
        });
        let cache = RequestCache::in_memory(60);
        let nonce = Arc::new(NonceDispatcher::new(Arc::clone(&chain)));
        let poller = StatusPoller::new(Arc::clone(&chain), Arc::clone(&cache));
        let adaptor: Arc<dyn VenueAdaptor> = Arc::new(FakeAdaptor);
        let events = EventDispatcher::new();
        let whitelist = Arc::new(Whitelist::empty());
        LifecycleManager::new(cache, nonce, poller, adaptor, test_signer_pool(), events, chain, whitelist, 500)
    }

    #[tokio::test]
    async fn approve_rejects_duplicate_ids() {
        let manager = manager(false);
        manager.approve("r1", "USDC", "1000000", 1_000_000_000).await.unwrap();
        let err = manager.approve("r1", "USDC", "1000000", 1_000_000_000).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn approve_rejects_gas_price_above_cap() {
        let manager = manager(false);
        let err = manager.approve("r1", "USDC", "1000000", 600_000_000_000).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GasPriceCapExceeded { .. }));
    }

    #[tokio::test]
    async fn cancel_unknown_request_is_not_found() {
        let manager = manager(false);
        let err = manager.cancel_request("missing", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_derives_gas_with_minimum_bump() {
        // S2: last_used=1_000_000_000, oracle=500_000_000 -> expect 1_100_000_000.
        let manager = manager(false);
        manager.approve("r1", "USDC", "1000000", 1_000_000_000).await.unwrap();
        let result = manager.cancel_request("r1", None).await.unwrap();
        let request = manager.cache.get("r1").unwrap();
        assert_eq!(request.last_used_gas_price(), Some(1_100_000_000));
        assert_eq!(request.request_status, RequestStatus::CancelRequested);
        assert!(!result.tx_hash.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_nonce_too_low_returns_cancel_window_closed() {
        let manager = manager(true);
        manager.cache.add(Request::new(
            "r1",
            RequestDetails::Order {
                symbol: "BTC-USD".into(),
                side: "BUY".into(),
                quantity: "1".into(),
                price: "1".into(),
                order_type: "LIMIT".into(),
            },
            0,
        )).unwrap();
        manager.cache.mutate("r1", |r| r.nonce = Some(7));
        let err = manager.cancel_request("r1", Some(2_000_000_000)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::CancelWindowClosed(_)));
    }
}
