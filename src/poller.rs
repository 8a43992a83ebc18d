//! Transaction Status Poller (spec.md §4.2): drives in-flight transactions to
//! a terminal status and reconciles builder-bundle venues whose target block
//! has passed without inclusion.
//!
//! The background-loop shape (spawn a task, `select!` against a
//! `CancellationToken`, `tokio::time::interval` for cadence) follows the
//! `SigDown` pattern (`sig_down.rs`), generalized from "wait for a
//! signal once" to "tick forever".

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::cache::RequestCache;
use crate::chain::{ChainClient, Receipt};
use crate::request::{ActionTag, RequestStatus};

/// Callback interface the Poller holds as a narrow dependency, breaking the
/// Lifecycle Manager ↔ Status Poller ↔ Cache cycle the source models with
/// direct references (spec.md §9 design note).
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn on_request_status_update(
        &self,
        client_request_id: &str,
        new_status: RequestStatus,
        receipt: Option<Receipt>,
        mined_tx_hash: Option<String>,
    );
}

struct PolledTx {
    client_request_id: String,
    action_tag: ActionTag,
}

pub struct StatusPoller {
    chain: Arc<dyn ChainClient>,
    cache: Arc<RequestCache>,
    in_flight: DashMap<String, PolledTx>,
    callback: std::sync::RwLock<Option<Weak<dyn StatusCallback>>>,
}

impl StatusPoller {
    pub fn new(chain: Arc<dyn ChainClient>, cache: Arc<RequestCache>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            cache,
            in_flight: DashMap::new(),
            callback: std::sync::RwLock::new(None),
        })
    }

    /// Set after the Lifecycle Manager is constructed, since it depends on
    /// this Poller already existing (spec.md §9: "ownership flows
    /// Cache → Poller → Lifecycle Manager").
    pub fn set_callback(&self, callback: Weak<dyn StatusCallback>) {
        *self.callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// `add_for_polling(tx_hash, client_request_id, action_tag)`.
    pub fn add_for_polling(&self, tx_hash: impl Into<String>, client_request_id: impl Into<String>, action_tag: ActionTag) {
        self.in_flight.insert(
            tx_hash.into(),
            PolledTx {
                client_request_id: client_request_id.into(),
                action_tag,
            },
        );
    }

    /// `poll_for_status(tx_hash)`: external fast-path trigger, e.g. from a
    /// chain WebSocket subscription for mined transactions.
    pub async fn poll_for_status(&self, tx_hash: &str) {
        if let Some(entry) = self.in_flight.get(tx_hash).map(|e| (e.client_request_id.clone(), e.action_tag)) {
            self.poll_one(tx_hash, &entry.0, entry.1).await;
        }
    }

    async fn poll_one(&self, tx_hash: &str, client_request_id: &str, action_tag: ActionTag) {
        let Some(request) = self.cache.get(client_request_id) else {
            self.in_flight.remove(tx_hash);
            return;
        };
        if request.is_finalised() {
            self.in_flight.remove(tx_hash);
            return;
        }
        let receipt = match self.chain.get_transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return, // not yet mined, expected
            Err(err) => {
                tracing::warn!(%tx_hash, error = %err, "receipt query failed, will retry");
                return;
            }
        };

        // A cancel at the same nonce consumes the nonce slot regardless of the
        // receipt's own status, so it is always terminal as CANCELED
        // (spec.md §4.2, §9 open question — not a bug, preserved as-is).
        let new_status = if action_tag == ActionTag::Cancel {
            RequestStatus::Canceled
        } else if receipt.succeeded() {
            RequestStatus::Succeeded
        } else {
            RequestStatus::Failed
        };

        self.in_flight.remove(tx_hash);
        self.notify(client_request_id, new_status, Some(receipt), Some(tx_hash.to_string()))
            .await;
    }

    async fn notify(
        &self,
        client_request_id: &str,
        new_status: RequestStatus,
        receipt: Option<Receipt>,
        mined_tx_hash: Option<String>,
    ) {
        let callback = self.callback.read().expect("callback lock poisoned").clone();
        if let Some(callback) = callback.and_then(|weak| weak.upgrade()) {
            callback
                .on_request_status_update(client_request_id, new_status, receipt, mined_tx_hash)
                .await;
        } else {
            tracing::warn!(%client_request_id, "no status callback registered, dropping update");
        }
    }

    /// Main receipt-polling loop: every `poll_interval`, sweep a snapshot of
    /// in-flight transactions (spec.md §4.2).
    pub fn spawn_polling_loop(self: Arc<Self>, poll_interval: std::time::Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot: Vec<(String, String, ActionTag)> = self
                            .in_flight
                            .iter()
                            .map(|e| (e.key().clone(), e.value().client_request_id.clone(), e.value().action_tag))
                            .collect();
                        for (tx_hash, client_request_id, action_tag) in snapshot {
                            self.poll_one(&tx_hash, &client_request_id, action_tag).await;
                        }
                    }
                }
            }
        });
    }

    /// Secondary loop for builder-bundle venues (spec.md §4.2
    /// "Target-block reconciliation"): every 1s, finalize as FAILED any
    /// non-finalized request whose targeted block has passed without
    /// including any of its transaction hashes.
    pub fn spawn_target_block_loop(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.reconcile_target_blocks().await,
                }
            }
        });
    }

    async fn reconcile_target_blocks(&self) {
        let Ok(head) = self.chain.current_head().await else {
            return;
        };
        for request in self.cache.get_all(None) {
            if request.is_finalised() {
                continue;
            }
            let Some(target) = request.dex_specific.targeted_block_num else {
                continue;
            };
            if target > head {
                continue;
            }
            let block = match self.chain.get_block(target).await {
                Ok(block) => block,
                Err(err) => {
                    tracing::warn!(client_request_id = %request.client_request_id, error = %err, "could not fetch target block");
                    continue;
                }
            };
            let included = request
                .tx_hashes
                .iter()
                .any(|entry| block.transactions.iter().any(|h| h.eq_ignore_ascii_case(&entry.hash)));
            if !included {
                tracing::info!(client_request_id = %request.client_request_id, target_block = target, "missed target block");
                self.notify(&request.client_request_id, RequestStatus::Failed, None, None).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, ChainClientError, SignedPayload, SubmitError, SubmitOutcome};
    use crate::request::{RequestDetails, RequestStatus};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeChain {
        receipt: Option<Receipt>,
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn submit_transaction(&self, _payload: SignedPayload) -> Result<SubmitOutcome, SubmitError> {
            unimplemented!()
        }
        async fn get_transaction_receipt(&self, _tx_hash: &str) -> Result<Option<Receipt>, ChainClientError> {
            Ok(self.receipt)
        }
        async fn get_block(&self, _num: u64) -> Result<Block, ChainClientError> {
            unimplemented!()
        }
        async fn current_head(&self) -> Result<u64, ChainClientError> {
            Ok(0)
        }
        async fn gas_price_fast_wei(&self) -> Result<u128, ChainClientError> {
            Ok(0)
        }
        async fn next_nonce(&self) -> Result<u64, ChainClientError> {
            Ok(0)
        }
        async fn reset_nonce(&self) {}
    }

    struct RecordingCallback {
        seen: std::sync::Mutex<Vec<RequestStatus>>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl StatusCallback for RecordingCallback {
        async fn on_request_status_update(
            &self,
            _client_request_id: &str,
            new_status: RequestStatus,
            _receipt: Option<Receipt>,
            _mined_tx_hash: Option<String>,
        ) {
            self.fired.store(true, Ordering::SeqCst);
            self.seen.lock().unwrap().push(new_status);
        }
    }

    fn order(id: &str) -> crate::request::Request {
        crate::request::Request::new(
            id,
            RequestDetails::Order {
                symbol: "BTC-USD".into(),
                side: "BUY".into(),
                quantity: "0.1".into(),
                price: "50000".into(),
                order_type: "LIMIT".into(),
            },
            0,
        )
    }

    #[tokio::test]
    async fn cancel_action_is_always_canceled_regardless_of_receipt_status() {
        let cache = RequestCache::in_memory(60);
        cache.add(order("r1")).unwrap();
        let chain: Arc<dyn ChainClient> = Arc::new(FakeChain {
            receipt: Some(Receipt { status: 0, block_number: 1 }),
        });
        let poller = StatusPoller::new(chain, Arc::clone(&cache));
        let callback: Arc<RecordingCallback> = Arc::new(RecordingCallback {
            seen: std::sync::Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
        });
        poller.set_callback(Arc::downgrade(&(callback.clone() as Arc<dyn StatusCallback>)));
        poller.add_for_polling("0xBBB", "r1", ActionTag::Cancel);
        poller.poll_one("0xBBB", "r1", ActionTag::Cancel).await;
        assert_eq!(callback.seen.lock().unwrap().as_slice(), &[RequestStatus::Canceled]);
    }

    #[tokio::test]
    async fn successful_receipt_yields_succeeded() {
        let cache = RequestCache::in_memory(60);
        cache.add(order("r1")).unwrap();
        let chain: Arc<dyn ChainClient> = Arc::new(FakeChain {
            receipt: Some(Receipt { status: 1, block_number: 1 }),
        });
        let poller = StatusPoller::new(chain, Arc::clone(&cache));
        let callback: Arc<RecordingCallback> = Arc::new(RecordingCallback {
            seen: std::sync::Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
        });
        poller.set_callback(Arc::downgrade(&(callback.clone() as Arc<dyn StatusCallback>)));
        poller.poll_one("0xAAA", "r1", ActionTag::Order).await;
        assert_eq!(callback.seen.lock().unwrap().as_slice(), &[RequestStatus::Succeeded]);
    }
}
