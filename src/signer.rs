//! Transaction Signer (spec.md §2, §5): turns a `BuiltCall` plus nonce and
//! gas price into a signed, submittable payload.
//!
//! ECDSA signing is CPU-bound, so spec.md §5 calls for a dedicated worker
//! pool sized by `max_signature_generators` rather than doing it inline on
//! the async handler. Async handlers are kept free of CPU-bound
//! work by pushing it into the provider's fill pipeline (`chain/evm.rs`'s
//! filler stack); here that pipeline doesn't exist because nonce and gas are
//! already decided upstream, so the equivalent is a bounded
//! `tokio::task::spawn_blocking` pool — a `Semaphore` caps how many blocking
//! signing jobs run at once, which is the tokio-idiomatic rendition of "a
//! worker pool of OS processes".

use std::sync::Arc;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, TxKind};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use tokio::sync::Semaphore;

use crate::adaptor::BuiltCall;
use crate::chain::SignedPayload;

const DEFAULT_GAS_LIMIT: u64 = 300_000;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing worker pool is shut down")]
    PoolClosed,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Bounded signing worker pool. One `PrivateKeySigner` per process, shared
/// across every in-flight signing job; concurrency is capped by `permits`,
/// not by key count, since this is a single hot-wallet account.
pub struct SignerPool {
    signer: Arc<PrivateKeySigner>,
    chain_id: u64,
    permits: Arc<Semaphore>,
}

impl SignerPool {
    pub fn new(signer: PrivateKeySigner, chain_id: u64, max_signature_generators: usize) -> Self {
        Self {
            signer: Arc::new(signer),
            chain_id,
            permits: Arc::new(Semaphore::new(max_signature_generators.max(1))),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Signs `call` at `nonce`/`gas_price_wei`, returning a raw, submittable
    /// payload. Runs on a blocking thread so the secp256k1 signature
    /// computation never occupies a tokio worker thread.
    pub async fn sign(&self, call: BuiltCall, nonce: u64, gas_price_wei: u128) -> Result<SignedPayload, SignerError> {
        let _permit = self.permits.acquire().await.map_err(|_| SignerError::PoolClosed)?;
        let signer = Arc::clone(&self.signer);
        let chain_id = self.chain_id;
        tokio::task::spawn_blocking(move || sign_blocking(&signer, chain_id, call, nonce, gas_price_wei))
            .await
            .map_err(|e| SignerError::Signing(e.to_string()))?
    }
}

fn sign_blocking(
    signer: &PrivateKeySigner,
    chain_id: u64,
    call: BuiltCall,
    nonce: u64,
    gas_price_wei: u128,
) -> Result<SignedPayload, SignerError> {
    let tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price: gas_price_wei,
        gas_limit: DEFAULT_GAS_LIMIT,
        to: TxKind::Call(call.to),
        value: call.value,
        input: call.calldata,
    };
    let signature_hash = tx.signature_hash();
    let signature = signer
        .sign_hash_sync(&signature_hash)
        .map_err(|e| SignerError::Signing(e.to_string()))?;
    let signed = tx.into_signed(signature);
    let envelope = TxEnvelope::Legacy(signed);
    Ok(SignedPayload {
        raw: envelope.encoded_2718(),
        nonce,
        gas_price_wei: Some(gas_price_wei),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U256};
    use crate::request::DexSpecific;

    fn test_signer() -> PrivateKeySigner {
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318a"
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn sign_produces_nonempty_raw_payload() {
        let pool = SignerPool::new(test_signer(), 1, 2);
        let call = BuiltCall {
            to: Address::ZERO,
            calldata: Bytes::new(),
            value: U256::ZERO,
            dex_specific: DexSpecific::default(),
        };
        let payload = pool.sign(call, 0, 1_000_000_000).await.unwrap();
        assert!(!payload.raw.is_empty());
        assert_eq!(payload.nonce, 0);
    }
}
