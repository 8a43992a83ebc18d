//! Multi-venue DEX proxy: request lifecycle, nonce dispatch, status polling
//! and durable caching in front of on-chain trading venues.
//!
//! # Modules
//!
//! - [`request`] — the `Request` entity and its status partial order.
//! - [`chain`] — the `ChainClient` contract and its reference EVM backend.
//! - [`nonce`] — serialized nonce allocation and builder-bundle bookkeeping.
//! - [`cache`] — the in-memory request index and its durable persistence.
//! - [`poller`] — receipt polling and target-block reconciliation.
//! - [`events`] — WebSocket subscription fan-out.
//! - [`adaptor`] / [`adaptors`] — the venue-adaptor contract and its
//!   reference implementation.
//! - [`signer`] — the bounded CPU-offloaded signing worker pool.
//! - [`whitelist`] — the withdrawal-address allowlist.
//! - [`lifecycle`] — the Request Lifecycle Manager, the orchestration core.
//! - [`handlers`] — the HTTP/WebSocket surface.
//! - [`config`] — process configuration.
//! - [`telemetry`] — logging initialisation.
//! - [`sig_down`] — graceful shutdown on SIGTERM/SIGINT.

pub mod adaptor;
pub mod adaptors;
pub mod cache;
pub mod chain;
pub mod config;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod nonce;
pub mod poller;
pub mod request;
pub mod sig_down;
pub mod signer;
pub mod telemetry;
pub mod whitelist;
