//! Venue adaptor contract (spec.md §9 design note): the boundary between the
//! venue-agnostic core (Lifecycle Manager, Nonce Dispatcher, Status Poller)
//! and a specific DEX's calldata, contract addresses, and submission style.
//!
//! Grounded in the `scheme/mod.rs` blueprint/registry pattern
//! (`X402SchemeFacilitator` / `X402SchemeId` / `X402SchemeFacilitatorBuilder` /
//! `SchemeBlueprints` / `SchemeRegistry`): a small trait for the operations
//! themselves, a separate identity trait, and a registry keyed by that
//! identity. This repo ships one adaptor (`adaptors::evm_reference`), so the
//! registry is a thin `HashMap` rather than a config-driven
//! builder pipeline — the blueprint indirection earns its keep once a second
//! venue shows up, which spec.md's "core plus one reference adaptor" budget
//! doesn't require yet.

use std::collections::HashMap;
use std::ops::Deref;

use alloy_primitives::{Address, Bytes, U256};

use crate::request::{DexSpecific, RequestDetails};

/// Identifies a venue this process can talk to.
pub trait VenueId {
    /// Short slug used in config and logs, e.g. `"evm-reference"`.
    fn id(&self) -> &str;
}

/// What the core asks a venue adaptor to do: turn a `Request`'s type-specific
/// fields into a signed, submittable payload at a given nonce. Signing itself
/// (`crate::signer`) is venue-agnostic; the adaptor only builds the calldata
/// and hands back an unsigned call plus the fields the Lifecycle Manager
/// needs to track it (targeted block, bundle membership, ...).
#[async_trait::async_trait]
pub trait VenueAdaptor: VenueId + Send + Sync {
    /// Builds the unsigned calldata for `details`, returning the raw
    /// transaction bytes ready for the signer and any venue-specific
    /// bookkeeping fields to stash on the `Request`.
    async fn build_call(
        &self,
        details: &RequestDetails,
        nonce: u64,
        gas_price_wei: u128,
    ) -> Result<BuiltCall, AdaptorError>;

    /// Builds a cancel transaction for an already-submitted request: same
    /// nonce, venue-specific no-op payload, at or above the minimum bump gas
    /// price the Lifecycle Manager computed (spec.md §4.1 cancel-request).
    async fn build_cancel(&self, nonce: u64, gas_price_wei: u128) -> Result<BuiltCall, AdaptorError>;
}

/// The output of building a call: an unsigned call target plus whatever venue
/// context the Request needs to carry forward. `crate::signer` turns this
/// into a fully signed `SignedPayload` by filling in nonce, gas price, and a
/// signature over the remaining fields.
#[derive(Debug, Clone)]
pub struct BuiltCall {
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub dex_specific: DexSpecific,
}

#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    #[error("unsupported request shape for this venue: {0}")]
    UnsupportedRequest(String),
    #[error("calldata encoding failed: {0}")]
    Encoding(String),
}

/// Registry of active adaptors, keyed by `VenueId::id()`.
#[derive(Default)]
pub struct AdaptorRegistry(HashMap<String, Box<dyn VenueAdaptor>>);

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: VenueAdaptor + 'static>(mut self, adaptor: A) -> Self {
        self.0.insert(adaptor.id().to_string(), Box::new(adaptor));
        self
    }

    pub fn get(&self, id: &str) -> Option<&dyn VenueAdaptor> {
        self.0.get(id).map(|v| v.deref())
    }
}
