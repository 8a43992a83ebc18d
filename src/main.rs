//! DEX proxy HTTP/WebSocket entrypoint.
//!
//! Wires together the Request Cache, Nonce Dispatcher, Status Poller, Signer
//! Pool, venue adaptor and Lifecycle Manager, then serves the HTTP/WS surface
//! defined in `handlers.rs`.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `RUST_LOG` controls the tracing filter

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy_provider::{Provider, ProviderBuilder};
use alloy_signer_local::PrivateKeySigner;
use axum::http::Method;
use axum::Router;
use tower_http::cors;

use dex_proxy::adaptor::VenueAdaptor;
use dex_proxy::adaptors::evm_reference::EvmReferenceAdaptor;
use dex_proxy::cache::{RedisStore, RequestCache};
use dex_proxy::chain::evm::EvmChainClient;
use dex_proxy::chain::ChainClient;
use dex_proxy::config::Config;
use dex_proxy::events::EventDispatcher;
use dex_proxy::handlers::{self, AppState};
use dex_proxy::lifecycle::LifecycleManager;
use dex_proxy::nonce::NonceDispatcher;
use dex_proxy::poller::{StatusCallback, StatusPoller};
use dex_proxy::sig_down::SigDown;
use dex_proxy::signer::SignerPool;
use dex_proxy::telemetry;
use dex_proxy::whitelist::Whitelist;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    telemetry::init(&config.log_filter);

    let signer: PrivateKeySigner = config.evm_private_key.parse()?;
    let address = signer.address();

    let probe_provider = ProviderBuilder::new().connect_http(config.rpc_url.clone());
    let chain_id = probe_provider.get_chain_id().await?;

    let chain: Arc<dyn ChainClient> = Arc::new(EvmChainClient::connect(&config.rpc_url, address).await?);

    let whitelist = Arc::new(match &config.whitelist_path {
        Some(path) => Whitelist::load_from_file(path)?,
        None => Whitelist::empty(),
    });

    let adaptor: Arc<dyn VenueAdaptor> = Arc::new(EvmReferenceAdaptor::new(
        config.reference_router_address,
        config.token_addresses()?,
    ));

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();

    let cache = if config.store_in_redis {
        let redis_url = config.redis_url.as_deref().expect("validated by Config::load");
        let store = RedisStore::connect(redis_url, &config.process_name).await?;
        RequestCache::with_store(
            Arc::new(store),
            config.finalised_requests_cleanup_after_s,
            Duration::from_secs(1),
            cancel.clone(),
        )
    } else {
        RequestCache::in_memory(config.finalised_requests_cleanup_after_s)
    };

    let recovered = cache.recover().await;

    let nonce = Arc::new(NonceDispatcher::new(Arc::clone(&chain)));
    nonce.seed_from_cache(cache.get_max_nonce()).await;

    let poller = StatusPoller::new(Arc::clone(&chain), Arc::clone(&cache));
    let events = EventDispatcher::new();
    let signer_pool = Arc::new(SignerPool::new(signer, chain_id, config.max_signature_generators));

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&cache),
        Arc::clone(&nonce),
        Arc::clone(&poller),
        Arc::clone(&adaptor),
        Arc::clone(&signer_pool),
        Arc::clone(&events),
        Arc::clone(&chain),
        Arc::clone(&whitelist),
        config.max_allowed_gas_price_gwei,
    ));
    poller.set_callback(Arc::downgrade(&(lifecycle.clone() as Arc<dyn StatusCallback>)));

    for request in &recovered {
        if request.is_finalised() {
            continue;
        }
        for entry in &request.tx_hashes {
            poller.add_for_polling(entry.hash.clone(), request.client_request_id.clone(), entry.action_tag);
        }
    }
    tracing::info!(count = recovered.len(), "re-registered recovered requests with the status poller");

    Arc::clone(&poller).spawn_polling_loop(Duration::from_secs(config.poll_interval_s), cancel.clone());
    Arc::clone(&poller).spawn_target_block_loop(cancel.clone());

    let state = AppState { lifecycle, events };
    let app: Router = handlers::routes()
        .with_state(state)
        .layer(telemetry::http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("starting server at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let shutdown_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    Ok(())
}
